use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::error::{Result, ServerError};

/// Default port for both dialects.
pub const DEFAULT_PORT: u16 = 1965;

/// Scheme of the base protocol.
pub const GEMINI_SCHEME: &str = "gemini";

/// Scheme of the extended dialect.
pub const GEMINI_PLUS_SCHEME: &str = "gemini+";

/// Longest request line accepted, in octets, excluding the CRLF.
pub const MAX_REQUEST_LINE: usize = 1024;

/// What the client sent before the first CRLF.
pub enum RequestLine {
	/// The empty request, answered with the dialect capability document.
	Info,
	/// The raw octets of a request line, CRLF stripped.
	Line(Vec<u8>),
}

/// The sentinel URL an empty request resolves to.
#[must_use]
pub fn info_url() -> Url {
	Url::parse("about:info").expect("sentinel URL parses")
}

/// Reads one request line, consuming the stream exactly up to and including
/// the terminating CRLF so any body octets stay unread.
///
/// # Errors
/// A lone LF, an EOF before CRLF, or a line longer than `max_len` are hard
/// errors; the caller closes the connection.
pub async fn read_request_line<R>(stream: &mut R, max_len: usize) -> Result<RequestLine>
where
	R: AsyncRead + Unpin,
{
	let mut line = Vec::with_capacity(64);
	loop {
		let byte = match stream.read_u8().await {
			Ok(b) => b,
			Err(_) => {
				return Err(ServerError::MalformedRequest(
					"connection ended before CRLF".to_string(),
				))
			}
		};
		match byte {
			b'\r' => match stream.read_u8().await {
				Ok(b'\n') => break,
				_ => {
					return Err(ServerError::MalformedRequest(
						"carriage return not followed by line feed".to_string(),
					))
				}
			},
			b'\n' => {
				return Err(ServerError::MalformedRequest(
					"bare line feed in request line".to_string(),
				))
			}
			other => {
				if line.len() >= max_len {
					return Err(ServerError::TooLarge(max_len));
				}
				line.push(other);
			}
		}
	}
	match line.is_empty() {
		true => Ok(RequestLine::Info),
		false => Ok(RequestLine::Line(line)),
	}
}

/// Parses a raw request line into an absolute URL.
///
/// # Errors
/// Rejects control characters, unescaped whitespace, non-UTF-8 octets,
/// relative URLs, unknown schemes and missing hosts.
pub fn parse_url(line: &[u8]) -> Result<Url> {
	if line
		.iter()
		.any(|&b| b < 0x20 || b == 0x7F || b == b' ')
	{
		return Err(ServerError::MalformedRequest(
			"control character or whitespace in URL".to_string(),
		));
	}
	let text = std::str::from_utf8(line)
		.map_err(|_| ServerError::MalformedRequest("URL is not UTF-8".to_string()))?;
	// URL normalization would resolve dot segments before path mapping ever
	// sees them, so traversal is rejected at the wire instead
	let without_query = text.split(['?', '#']).next().unwrap_or(text);
	if without_query.split('/').any(|seg| seg == ".." || seg == ".") {
		return Err(ServerError::MalformedRequest(
			"dot segment in URL path".to_string(),
		));
	}
	let url = Url::parse(text)
		.map_err(|e| ServerError::MalformedRequest(format!("URL does not parse: {e}")))?;
	if !is_gemini(&url) && !is_extended(&url) {
		return Err(ServerError::MalformedRequest(format!(
			"unsupported scheme {:?}",
			url.scheme()
		)));
	}
	if url.host_str().is_none() {
		return Err(ServerError::MalformedRequest(
			"URL has no host".to_string(),
		));
	}
	Ok(url)
}

/// Whether the URL uses the base scheme.
#[must_use]
pub fn is_gemini(url: &Url) -> bool {
	url.scheme().eq_ignore_ascii_case(GEMINI_SCHEME)
}

/// Whether the URL opts into the extended dialect.
#[must_use]
pub fn is_extended(url: &Url) -> bool {
	url.scheme().eq_ignore_ascii_case(GEMINI_PLUS_SCHEME)
}

/// The URL's port, falling back to the protocol default.
#[must_use]
pub fn effective_port(url: &Url) -> u16 {
	url.port().unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn read(bytes: &[u8]) -> Result<RequestLine> {
		let mut input = bytes;
		read_request_line(&mut input, MAX_REQUEST_LINE).await
	}

	#[tokio::test]
	async fn reads_a_line_up_to_crlf() {
		match read(b"gemini://example/\r\nleftover").await.unwrap() {
			RequestLine::Line(line) => assert_eq!(line, b"gemini://example/"),
			RequestLine::Info => panic!("expected a line"),
		}
	}

	#[tokio::test]
	async fn leaves_body_octets_unread() {
		let mut input: &[u8] = b"gemini://example/\r\nBODY";
		let _ = read_request_line(&mut input, MAX_REQUEST_LINE)
			.await
			.unwrap();
		assert_eq!(input, b"BODY");
	}

	#[tokio::test]
	async fn empty_line_is_the_info_sentinel() {
		assert!(matches!(read(b"\r\n").await.unwrap(), RequestLine::Info));
	}

	#[tokio::test]
	async fn bare_line_feed_is_fatal() {
		assert!(matches!(
			read(b"gemini://example/\n").await,
			Err(ServerError::MalformedRequest(_))
		));
	}

	#[tokio::test]
	async fn eof_before_crlf_is_fatal() {
		assert!(matches!(
			read(b"gemini://example/").await,
			Err(ServerError::MalformedRequest(_))
		));
	}

	#[tokio::test]
	async fn overrun_reports_too_large() {
		let long = vec![b'a'; MAX_REQUEST_LINE + 1];
		assert!(matches!(
			read(&long).await,
			Err(ServerError::TooLarge(MAX_REQUEST_LINE))
		));
	}

	#[test]
	fn parses_both_dialect_schemes() {
		let base = parse_url(b"gemini://example.org/path?q=1").unwrap();
		assert!(is_gemini(&base));
		assert!(!is_extended(&base));
		let plus = parse_url(b"gemini+://example.org/").unwrap();
		assert!(is_extended(&plus));
	}

	#[test]
	fn scheme_check_is_case_insensitive() {
		assert!(parse_url(b"GEMINI://example.org/").is_ok());
	}

	#[test]
	fn default_port_applies() {
		let url = parse_url(b"gemini://example.org/").unwrap();
		assert_eq!(effective_port(&url), DEFAULT_PORT);
		let url = parse_url(b"gemini://example.org:1966/").unwrap();
		assert_eq!(effective_port(&url), 1966);
	}

	#[test]
	fn rejects_dot_segments() {
		assert!(parse_url(b"gemini://example/../etc").is_err());
		assert!(parse_url(b"gemini://example/a/./b").is_err());
		assert!(parse_url(b"gemini://example/a..b/").is_ok());
	}

	#[test]
	fn rejects_junk() {
		assert!(parse_url(b"gemini://exa mple/").is_err());
		assert!(parse_url(b"gemini://example/\x01").is_err());
		assert!(parse_url(b"http://example/").is_err());
		assert!(parse_url(b"not a url").is_err());
		assert!(parse_url(b"gemini:relative").is_err());
		assert!(parse_url(&[0xFF, 0xFE]).is_err());
	}
}
