use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Result, ServerError};
use crate::wire::format_extended;

/// The status vocabulary of the protocol.
///
/// The numeric grouping follows the wire: 1x input, 2x success, 3x redirect,
/// 4x temporary failure, 5x permanent failure, 6x certificate trouble. 51 is
/// the canonical "resource not found" answer even though it sits in the
/// permanent block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
	/// The server wants a query string.
	Input = 10,
	/// As [`Status::Input`], but the client should not echo the input.
	SensitiveInput = 11,
	/// The request succeeded; the meta is a MIME type and a body follows.
	Success = 20,
	/// Follow the meta URL for this request only.
	TemporaryRedirect = 30,
	/// Follow the meta URL for all future requests.
	PermanentRedirect = 31,
	/// The request failed but may work later.
	TemporaryFailure = 40,
	/// The server is down for maintenance or overloaded.
	ServerUnavailable = 41,
	/// A backend application failed.
	CgiError = 42,
	/// A proxied upstream request failed.
	ProxyError = 43,
	/// The client should back off.
	SlowDown = 44,
	/// The request failed and always will.
	PermanentFailure = 50,
	/// No resource at this URL.
	NotFound = 51,
	/// The resource existed once and is gone.
	Gone = 52,
	/// This server does not proxy for the requested authority.
	ProxyRequestRefused = 53,
	/// The request line could not be understood.
	BadRequest = 59,
	/// A client certificate is required and none was presented.
	ClientCertificateRequired = 60,
	/// The presented certificate is not authorized for the resource.
	CertificateNotAuthorized = 61,
	/// The presented certificate is unacceptable.
	CertificateNotValid = 62,
}

impl Status {
	/// The two-digit wire code.
	#[must_use]
	pub fn code(self) -> u8 {
		self as u8
	}

	/// Canonical status text, the name of the code on the wire.
	#[must_use]
	pub fn text(self) -> &'static str {
		match self {
			Status::Input => "Input",
			Status::SensitiveInput => "SensitiveInput",
			Status::Success => "Success",
			Status::TemporaryRedirect => "TemporaryRedirect",
			Status::PermanentRedirect => "PermanentRedirect",
			Status::TemporaryFailure => "TemporaryFailure",
			Status::ServerUnavailable => "ServerUnavailable",
			Status::CgiError => "CgiError",
			Status::ProxyError => "ProxyError",
			Status::SlowDown => "SlowDown",
			Status::PermanentFailure => "PermanentFailure",
			Status::NotFound => "NotFound",
			Status::Gone => "Gone",
			Status::ProxyRequestRefused => "ProxyRequestRefused",
			Status::BadRequest => "BadRequest",
			Status::ClientCertificateRequired => "ClientCertificateRequired",
			Status::CertificateNotAuthorized => "CertificateNotAuthorized",
			Status::CertificateNotValid => "CertificateNotValid",
		}
	}
}

/// Whether a raw code carries a body on the wire.
#[must_use]
pub fn is_success_code(code: u8) -> bool {
	(20..=29).contains(&code)
}

/// Range of codes the protocol defines at all.
#[must_use]
pub fn is_wire_code(code: u8) -> bool {
	(10..=69).contains(&code)
}

/// Default meta for successful responses that did not set one.
pub const DEFAULT_SUCCESS_META: &str = "text/gemini; charset=utf-8";

/// Longest meta line written to the wire, in octets.
pub const MAX_META_LENGTH: usize = 1024;

/// A response body, owned by the response and consumed by the writer.
pub enum Body {
	/// No body.
	Empty,
	/// An in-memory body.
	Bytes(Vec<u8>),
	/// A streamed body, copied to the wire in blocks.
	Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for Body {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Body::Empty => write!(f, "Body::Empty"),
			Body::Bytes(b) => write!(f, "Body::Bytes({} octets)", b.len()),
			Body::Stream(_) => write!(f, "Body::Stream"),
		}
	}
}

/// A response as a host produces it: a status, a meta line, an optional body
/// and optional extended meta attributes.
#[derive(Debug)]
pub struct Response {
	/// Raw status code. Codes outside 10–69 are rewritten by the writer.
	pub status: u8,
	/// The status line remainder: MIME-ish for success, prose otherwise.
	pub meta: String,
	/// Body; only written for success codes.
	pub body: Body,
	/// Extended meta attributes, serialized only for the extended dialect.
	pub attributes: Vec<(String, String)>,
}

impl Response {
	/// A bodyless response with the canonical status text.
	#[must_use]
	pub fn with_status(status: Status) -> Response {
		Response {
			status: status.code(),
			meta: status.text().to_string(),
			body: Body::Empty,
			attributes: Vec::new(),
		}
	}

	/// A bodyless response with custom status text.
	#[must_use]
	pub fn failure(status: Status, meta: impl Into<String>) -> Response {
		Response {
			status: status.code(),
			meta: meta.into(),
			body: Body::Empty,
			attributes: Vec::new(),
		}
	}

	/// A success response with a MIME meta and a body.
	#[must_use]
	pub fn success(meta: impl Into<String>, body: Body) -> Response {
		Response {
			status: Status::Success.code(),
			meta: meta.into(),
			body,
			attributes: Vec::new(),
		}
	}

	/// A redirect to the given target.
	#[must_use]
	pub fn redirect(status: Status, target: impl Into<String>) -> Response {
		Response {
			status: status.code(),
			meta: target.into(),
			body: Body::Empty,
			attributes: Vec::new(),
		}
	}

	/// Appends an extended meta attribute.
	#[must_use]
	pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Response {
		self.attributes.push((key.into(), value.into()));
		self
	}
}

/// Block size for streamed bodies.
const COPY_BLOCK: usize = 16 * 1024;

fn sanitize_meta(meta: &str) -> String {
	let mut cleaned: String = meta
		.chars()
		.map(|c| match (c as u32) < 0x20 {
			true => ' ',
			false => c,
		})
		.collect();
	while cleaned.len() > MAX_META_LENGTH {
		cleaned.pop();
	}
	cleaned
}

/// Serializes a response onto the wire and flushes it.
///
/// Out-of-range status codes are rewritten to 42 with a diagnostic meta;
/// control characters in the meta become spaces; a success response with an
/// empty meta gets [`DEFAULT_SUCCESS_META`]. Each write is bounded by
/// `write_timeout`.
///
/// # Errors
/// Propagates I/O errors and timeouts; the caller logs and closes.
pub async fn write_response<W>(
	stream: &mut W,
	response: Response,
	extended_meta: bool,
	write_timeout: Duration,
) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	let Response {
		mut status,
		mut meta,
		body,
		attributes,
	} = response;

	if !is_wire_code(status) {
		meta = format!("A backend application generated an invalid status code of {status}");
		status = Status::CgiError.code();
	}
	if is_success_code(status) {
		if meta.trim().is_empty() {
			meta = DEFAULT_SUCCESS_META.to_string();
		}
		if extended_meta && !attributes.is_empty() {
			meta = format_extended(&meta, &attributes);
		}
	}
	let header = format!("{status} {}\r\n", sanitize_meta(&meta));
	timed_write(stream, header.as_bytes(), write_timeout).await?;

	if is_success_code(status) {
		match body {
			Body::Empty => (),
			Body::Bytes(bytes) => timed_write(stream, &bytes, write_timeout).await?,
			Body::Stream(mut reader) => {
				let mut block = vec![0u8; COPY_BLOCK];
				loop {
					let read = reader.read(&mut block).await?;
					if read == 0 {
						break;
					}
					timed_write(stream, &block[..read], write_timeout).await?;
				}
			}
		}
	}
	timeout(write_timeout, stream.flush())
		.await
		.map_err(|_| timeout_error())??;
	Ok(())
}

async fn timed_write<W>(stream: &mut W, bytes: &[u8], limit: Duration) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	timeout(limit, stream.write_all(bytes))
		.await
		.map_err(|_| timeout_error())??;
	Ok(())
}

fn timeout_error() -> ServerError {
	ServerError::Filesystem(std::io::Error::new(
		std::io::ErrorKind::TimedOut,
		"write timed out",
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	const WRITE_LIMIT: Duration = Duration::from_secs(5);

	async fn written(response: Response, extended: bool) -> Vec<u8> {
		let mut out = Vec::new();
		write_response(&mut out, response, extended, WRITE_LIMIT)
			.await
			.unwrap();
		out
	}

	#[tokio::test]
	async fn success_with_body_and_default_meta() {
		let out = written(
			Response::success("", Body::Bytes(b"hello\n".to_vec())),
			false,
		)
		.await;
		assert_eq!(out, b"20 text/gemini; charset=utf-8\r\nhello\n");
	}

	#[tokio::test]
	async fn failure_carries_no_body() {
		let mut r = Response::with_status(Status::NotFound);
		r.body = Body::Bytes(b"should not appear".to_vec());
		let out = written(r, false).await;
		assert_eq!(out, b"51 NotFound\r\n");
	}

	#[tokio::test]
	async fn out_of_range_status_is_rewritten() {
		let out = written(Response::failure_code_for_test(200), false).await;
		assert_eq!(
			out,
			b"42 A backend application generated an invalid status code of 200\r\n"
		);
	}

	#[tokio::test]
	async fn control_characters_become_spaces() {
		let out = written(
			Response::failure(Status::BadRequest, "line\r\nsplit\ttab"),
			false,
		)
		.await;
		assert_eq!(out, b"59 line  split tab\r\n");
	}

	#[tokio::test]
	async fn attributes_only_serialize_for_the_extended_dialect() {
		let make = || {
			Response::success("text/plain", Body::Bytes(b"x".to_vec()))
				.attribute("Size", "1")
		};
		let plain = written(make(), false).await;
		assert!(plain.starts_with(b"20 text/plain\r\n"));
		let extended = written(make(), true).await;
		assert!(extended.starts_with(b"20 text/plain; Size=1\r\n"));
	}

	#[tokio::test]
	async fn streamed_bodies_are_copied_in_blocks() {
		let payload = vec![b'z'; COPY_BLOCK * 2 + 17];
		let body = Body::Stream(Box::new(std::io::Cursor::new(payload.clone())));
		let out = written(Response::success("application/octet-stream", body), false).await;
		assert!(out.ends_with(&payload));
	}

	#[tokio::test]
	async fn meta_is_capped() {
		let out = written(
			Response::failure(Status::BadRequest, "x".repeat(MAX_META_LENGTH * 2)),
			false,
		)
		.await;
		// "59 " + capped meta + CRLF
		assert_eq!(out.len(), 3 + MAX_META_LENGTH + 2);
	}

	impl Response {
		fn failure_code_for_test(code: u8) -> Response {
			Response {
				status: code,
				meta: "OK".to_string(),
				body: Body::Empty,
				attributes: Vec::new(),
			}
		}
	}
}
