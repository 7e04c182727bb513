//! End-to-end pipeline scenarios over in-memory streams.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use gemplus::hosts::{Host, HostChain, StaticFilesHost};
use gemplus::server::{serve, PipelineSettings, Request};
use gemplus::wire::{Body, Response};

fn remote() -> SocketAddr {
	"198.51.100.2:49152".parse().unwrap()
}

async fn roundtrip(chain: &HostChain, request: &[u8]) -> Vec<u8> {
	let (mut client, server_side) = duplex(256 * 1024);
	client.write_all(request).await.unwrap();
	serve(server_side, remote(), None, chain, &PipelineSettings::default()).await;
	let mut out = Vec::new();
	client.read_to_end(&mut out).await.unwrap();
	out
}

fn fixture_site() -> (tempfile::TempDir, StaticFilesHost) {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("index.gmi"), "# welcome\n=> about.gmi about\n").unwrap();
	std::fs::create_dir(dir.path().join("dir")).unwrap();
	std::fs::write(dir.path().join("dir/leaf.txt"), "leaf\n").unwrap();
	let host = StaticFilesHost::single_root(dir.path().to_path_buf()).unwrap();
	(dir, host)
}

async fn site_chain() -> (tempfile::TempDir, HostChain) {
	let (dir, host) = fixture_site();
	let chain = HostChain::build(vec![Box::new(host)]).await.unwrap();
	(dir, chain)
}

/// S1: a static-file host with an index document answers the root URL.
#[tokio::test]
async fn root_url_serves_the_index_document() {
	let (_dir, chain) = site_chain().await;
	let out = roundtrip(&chain, b"gemini://example/\r\n").await;
	let expected: &[u8] = b"20 text/gemini; charset=utf-8\r\n# welcome\n=> about.gmi about\n";
	assert_eq!(out, expected);
}

/// S2: dot segments in the request line are a bad request.
#[tokio::test]
async fn traversal_attempts_get_bad_request() {
	let (_dir, chain) = site_chain().await;
	let out = roundtrip(&chain, b"gemini://example/../etc\r\n").await;
	assert_eq!(out, b"59 BadRequest\r\n");
}

/// S3: the empty request is answered with the capability document.
#[tokio::test]
async fn empty_request_yields_the_capability_document() {
	let (_dir, chain) = site_chain().await;
	let out = roundtrip(&chain, b"\r\n").await;
	let text = String::from_utf8(out).unwrap();
	let (header, body) = text.split_once("\r\n").unwrap();
	assert_eq!(header, "20 text/gemini+info");
	assert!(body.starts_with("[FORM]\n"));
	for section in ["[FORM]", "[META]", "[BODY]", "[TCP]"] {
		assert!(body.contains(section), "missing {section} in:\n{body}");
	}
	assert!(body.contains("multi=y"));
	assert!(body.contains("extended=y"));
	assert!(body.contains("keepalive=n"));
}

/// S4: a directory URL without a trailing slash redirects to one with it.
#[tokio::test]
async fn directory_without_slash_redirects() {
	let (_dir, chain) = site_chain().await;
	let out = roundtrip(&chain, b"gemini://example/dir\r\n").await;
	assert_eq!(out, b"31 /dir/\r\n");
}

/// S7: a line feed without a carriage return closes without a response.
#[tokio::test]
async fn bare_line_feed_closes_without_response() {
	let (_dir, chain) = site_chain().await;
	let out = roundtrip(&chain, b"gemini://example/\n").await;
	assert!(out.is_empty());
}

/// Unknown URLs exhaust the chain and yield 51.
#[tokio::test]
async fn exhausted_chain_is_not_found() {
	let (_dir, chain) = site_chain().await;
	let out = roundtrip(&chain, b"gemini://example/missing.gmi\r\n").await;
	assert_eq!(out, b"51 NotFound\r\n");
}

/// A host that echoes every payload it was handed, `|`-separated.
struct UploadProbe;

#[async_trait]
impl Host for UploadProbe {
	fn type_name(&self) -> &'static str {
		"pipeline::UploadProbe"
	}

	async fn respond(&self, request: &mut Request) -> anyhow::Result<Option<Response>> {
		let mut echoed = Vec::new();
		for file in &request.files {
			if !echoed.is_empty() {
				echoed.push(b'|');
			}
			echoed.extend(file.bytes().await?);
		}
		Ok(Some(Response::success(
			"application/octet-stream",
			Body::Bytes(echoed),
		)))
	}
}

/// S5: three declared files split a concatenated body by size, in index
/// order.
#[tokio::test]
async fn multi_file_body_splits_by_declared_sizes() {
	let chain = HostChain::build(vec![Box::new(UploadProbe)])
		.await
		.unwrap();
	let request = b"gemini+://example/upload?\
		a=a.bin&a.index=1&a.size=5&\
		b=b.bin&b.index=2&b.size=7&\
		c=c.bin&c.index=3&c.size=9\r\n\
		aaaaabbbbbbbccccccccc";
	let out = roundtrip(&chain, request).await;
	let expected: &[u8] = b"20 application/octet-stream\r\naaaaa|bbbbbbb|ccccccccc";
	assert_eq!(out, expected);
}

/// S6: a gap in the file indices is a malformed form, reported as 42.
#[tokio::test]
async fn missing_file_index_is_reported_as_backend_error() {
	let chain = HostChain::build(vec![Box::new(UploadProbe)]).await.unwrap();
	let request =
		b"gemini+://example/upload?a=a&a.index=1&a.size=5&c=c&c.index=3&c.size=9\r\n";
	let out = roundtrip(&chain, request).await;
	let text = String::from_utf8(out).unwrap();
	assert!(text.starts_with("42 "), "unexpected response: {text}");
	assert!(text.contains("malformed form"), "no diagnostic: {text}");
}

/// A host that answers with a raw, out-of-range status code.
struct MisbehavingHost;

#[async_trait]
impl Host for MisbehavingHost {
	fn type_name(&self) -> &'static str {
		"pipeline::MisbehavingHost"
	}

	async fn respond(&self, _request: &mut Request) -> anyhow::Result<Option<Response>> {
		Ok(Some(Response {
			status: 200,
			meta: "OK".to_string(),
			body: Body::Empty,
			attributes: Vec::new(),
		}))
	}
}

/// S8: an out-of-range status is rewritten to 42 with a diagnostic.
#[tokio::test]
async fn invalid_status_codes_are_rewritten() {
	let chain = HostChain::build(vec![Box::new(MisbehavingHost)])
		.await
		.unwrap();
	let out = roundtrip(&chain, b"gemini://example/\r\n").await;
	assert_eq!(
		out,
		&b"42 A backend application generated an invalid status code of 200\r\n"[..]
	);
}

/// A host whose failure carries a context chain.
struct FailingHost;

#[async_trait]
impl Host for FailingHost {
	fn type_name(&self) -> &'static str {
		"pipeline::FailingHost"
	}

	async fn respond(&self, _request: &mut Request) -> anyhow::Result<Option<Response>> {
		use anyhow::Context;
		let inner: anyhow::Result<()> = Err(anyhow::anyhow!("disk on fire"));
		inner.context("reading the archive")?;
		Ok(None)
	}
}

/// Host failures become 42 with the flattened context chain.
#[tokio::test]
async fn host_failures_report_the_error_chain() {
	let chain = HostChain::build(vec![Box::new(FailingHost)]).await.unwrap();
	let out = roundtrip(&chain, b"gemini://example/\r\n").await;
	let text = String::from_utf8(out).unwrap();
	assert!(text.starts_with("42 "), "unexpected response: {text}");
	assert!(text.contains("reading the archive"));
	assert!(text.contains("disk on fire"));
}

/// A host whose rewrite swallows the request.
struct SilencingHost;

#[async_trait]
impl Host for SilencingHost {
	fn type_name(&self) -> &'static str {
		"pipeline::SilencingHost"
	}

	async fn rewrite(&self, _request: &Request) -> Option<url::Url> {
		None
	}

	async fn respond(&self, _request: &mut Request) -> anyhow::Result<Option<Response>> {
		Ok(Some(Response::success("text/plain", Body::Empty)))
	}
}

/// A rewrite returning `None` terminates the request with no response.
#[tokio::test]
async fn rewrite_none_closes_silently() {
	let chain = HostChain::build(vec![Box::new(SilencingHost)])
		.await
		.unwrap();
	let out = roundtrip(&chain, b"gemini://example/\r\n").await;
	assert!(out.is_empty());
}

/// A host that rewrites every URL to the index document.
struct RewritingHost;

#[async_trait]
impl Host for RewritingHost {
	fn priority(&self) -> u16 {
		1
	}

	fn type_name(&self) -> &'static str {
		"pipeline::RewritingHost"
	}

	async fn rewrite(&self, request: &Request) -> Option<url::Url> {
		let mut url = request.url.clone();
		url.set_path("/");
		Some(url)
	}

	async fn respond(&self, _request: &mut Request) -> anyhow::Result<Option<Response>> {
		Ok(None)
	}
}

/// A rewriting host hands the new URL to the rest of the chain.
#[tokio::test]
async fn rewrites_feed_the_next_host() {
	let (_dir, site) = fixture_site();
	let chain = HostChain::build(vec![Box::new(RewritingHost), Box::new(site)])
		.await
		.unwrap();
	let out = roundtrip(&chain, b"gemini://example/anything-at-all\r\n").await;
	assert!(out.starts_with(b"20 text/gemini; charset=utf-8\r\n"));
}

/// A host that never answers.
struct StuckHost;

#[async_trait]
impl Host for StuckHost {
	fn type_name(&self) -> &'static str {
		"pipeline::StuckHost"
	}

	async fn respond(&self, _request: &mut Request) -> anyhow::Result<Option<Response>> {
		std::future::pending::<()>().await;
		Ok(None)
	}
}

/// A flipped cancellation token abandons the request at the next
/// suspension point.
#[tokio::test]
async fn cancellation_interrupts_a_stuck_request() {
	use gemplus::server::serve_cancellable;
	let chain = HostChain::build(vec![Box::new(StuckHost)]).await.unwrap();
	let (mut client, server_side) = duplex(64 * 1024);
	client.write_all(b"gemini://example/\r\n").await.unwrap();
	let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
	let pipeline_settings = PipelineSettings::default();
	let worker = serve_cancellable(
		server_side,
		remote(),
		None,
		&chain,
		&pipeline_settings,
		cancel_rx,
	);
	tokio::pin!(worker);
	// the worker parks inside the stuck host until the token flips
	tokio::select! {
		() = &mut worker => panic!("worker finished on its own"),
		() = tokio::time::sleep(std::time::Duration::from_millis(50)) => (),
	}
	cancel_tx.send(true).unwrap();
	tokio::time::timeout(std::time::Duration::from_secs(1), worker)
		.await
		.expect("cancellation should end the worker");
	let mut out = Vec::new();
	client.read_to_end(&mut out).await.unwrap();
	assert!(out.is_empty());
}

/// Oversized request lines terminate the connection without a response.
#[tokio::test]
async fn overlong_request_lines_close_silently() {
	let (_dir, chain) = site_chain().await;
	let mut request = vec![b'a'; 2000];
	request.extend_from_slice(b"\r\n");
	let out = roundtrip(&chain, &request).await;
	assert!(out.is_empty());
}
