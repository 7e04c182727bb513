use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::certs::ClientCertificate;
use crate::error::{Result, ServerError};
use crate::forms::{materialize, read_exact_octets, FileUpload, Form};
use crate::hosts::{ChainOutcome, HostChain};
use crate::limiter::Limiter;
use crate::server::Request;
use crate::tls::DEFAULT_IO_TIMEOUT;
use crate::wire::{
	info_url, is_extended, parse_url, read_request_line, write_response, Body, RequestLine,
	Response, Status, INFO_MIME, MAX_REQUEST_LINE,
};

/// The capability document returned for the empty request. Absent keys mean
/// no support.
const CAPABILITIES: &str = "[FORM]\n\
	multi=y\n\
	files=y\n\
	stream=n\n\
	\n\
	[META]\n\
	extended=y\n\
	\n\
	[BODY]\n\
	compress=n\n\
	range=n\n\
	\n\
	[TCP]\n\
	keepalive=n\n\
	raw=n\n";

/// Tunables shared by every connection worker of a listener.
pub struct PipelineSettings {
	/// Bound on each read from the decrypted stream.
	pub read_timeout: Duration,
	/// Bound on each write to the decrypted stream.
	pub write_timeout: Duration,
	/// Longest accepted request line, in octets.
	pub max_request_line: usize,
	/// Admission limiter, when the listener shares host resources.
	pub admission: Option<Arc<Limiter>>,
	/// How long a worker may wait for admission before giving up.
	pub admission_deadline: Duration,
}

impl Default for PipelineSettings {
	fn default() -> Self {
		PipelineSettings {
			read_timeout: DEFAULT_IO_TIMEOUT,
			write_timeout: DEFAULT_IO_TIMEOUT,
			max_request_line: MAX_REQUEST_LINE,
			admission: None,
			admission_deadline: DEFAULT_IO_TIMEOUT,
		}
	}
}

/// The dialect capability response for the empty request.
#[must_use]
pub fn capability_response() -> Response {
	Response::success(INFO_MIME, Body::Bytes(CAPABILITIES.as_bytes().to_vec()))
}

/// Runs one connection through the pipeline and shuts the stream down.
///
/// Every outcome ends here: errors that warrant a status line get one,
/// everything else is logged and the connection just closes.
pub async fn serve<S>(
	mut stream: S,
	remote: SocketAddr,
	client_cert: Option<ClientCertificate>,
	chain: &HostChain,
	settings: &PipelineSettings,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	if let Err(e) = handle(&mut stream, remote, client_cert, chain, settings).await {
		debug!(%remote, error = %e, "connection closed on error");
	}
	let _ = stream.shutdown().await;
}

/// As [`serve`], but interruptible: when `cancel` flips to `true` the next
/// suspension point abandons the request, and dropping the request state
/// cleans the scratch directory up.
pub async fn serve_cancellable<S>(
	mut stream: S,
	remote: SocketAddr,
	client_cert: Option<ClientCertificate>,
	chain: &HostChain,
	settings: &PipelineSettings,
	mut cancel: tokio::sync::watch::Receiver<bool>,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let cancelled = async {
		while !*cancel.borrow() {
			if cancel.changed().await.is_err() {
				// sender gone; nobody can cancel any more
				std::future::pending::<()>().await;
			}
		}
	};
	tokio::select! {
		() = cancelled => {
			debug!(%remote, "request cancelled");
		}
		() = async {
			if let Err(e) = handle(&mut stream, remote, client_cert, chain, settings).await {
				debug!(%remote, error = %e, "connection closed on error");
			}
		} => (),
	}
	let _ = stream.shutdown().await;
}

async fn handle<S>(
	stream: &mut S,
	remote: SocketAddr,
	client_cert: Option<ClientCertificate>,
	chain: &HostChain,
	settings: &PipelineSettings,
) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let _permit = match &settings.admission {
		Some(limiter) => match limiter.take(settings.admission_deadline).await {
			Some(permit) => Some(permit),
			None => {
				return send(
					stream,
					Response::with_status(Status::ServerUnavailable),
					false,
					settings,
				)
				.await
			}
		},
		None => None,
	};

	let line = match timeout(
		settings.read_timeout,
		read_request_line(stream, settings.max_request_line),
	)
	.await
	{
		Ok(read) => read,
		Err(_) => {
			debug!(%remote, "request line timed out");
			return Ok(());
		}
	};
	let line = match line {
		Ok(RequestLine::Info) => {
			// the empty request asks what this dialect can do
			debug!(%remote, url = %info_url(), "capability request");
			return send(stream, capability_response(), false, settings).await;
		}
		Ok(RequestLine::Line(line)) => line,
		Err(e) => {
			// a broken or overlong request line gets no response at all
			debug!(%remote, error = %e, "unreadable request line");
			return Ok(());
		}
	};

	let url = match parse_url(&line) {
		Ok(url) => url,
		Err(e) => {
			debug!(%remote, error = %e, "request line is not a usable URL");
			return send(
				stream,
				Response::with_status(Status::BadRequest),
				false,
				settings,
			)
			.await;
		}
	};
	let extended = is_extended(&url);
	let mut request = Request::new(url, remote, client_cert);
	debug!(%remote, id = %request.id, url = %request.url, "request");

	if let Err(e) = ingest(stream, &mut request, settings).await {
		return match e {
			ServerError::MalformedForm(_) => {
				send(
					stream,
					Response::failure(Status::CgiError, e.chain_message()),
					extended,
					settings,
				)
				.await
			}
			// a truncated body gets nothing; the stream position is gone
			other => Err(other),
		};
	}

	match walk(stream, &mut request, chain, settings).await {
		Ok(ChainOutcome::Silent) => Ok(()),
		Ok(ChainOutcome::Response(response)) => {
			send(stream, response, extended, settings).await
		}
		Err(ServerError::HostFailure(e)) => {
			warn!(%remote, id = %request.id, error = %format!("{e:#}"), "host failed");
			send(
				stream,
				Response::failure(
					Status::CgiError,
					ServerError::HostFailure(e).chain_message(),
				),
				extended,
				settings,
			)
			.await
		}
		Err(other) => Err(other),
	}
}

/// Replaces a body-mode form with the form carried in the request body and
/// turns the declared files into pending uploads.
async fn ingest<S>(
	stream: &mut S,
	request: &mut Request,
	settings: &PipelineSettings,
) -> Result<()>
where
	S: AsyncRead + Unpin + Send,
{
	if let Some(marker) = request.form.body_mode() {
		let body = read_exact_octets(stream, marker.size, settings.read_timeout).await?;
		let text = String::from_utf8_lossy(&body);
		request.form = Form::decode(text.trim_start_matches('?'));
	}
	request.files = request
		.form
		.declared_files()?
		.into_iter()
		.map(FileUpload::from_decl)
		.collect();
	Ok(())
}

/// Walks the chain: filter, rewrite, materialize once, respond.
async fn walk<S>(
	stream: &mut S,
	request: &mut Request,
	chain: &HostChain,
	settings: &PipelineSettings,
) -> Result<ChainOutcome>
where
	S: AsyncRead + Unpin + Send,
{
	let mut materialized = false;
	for host in chain.hosts() {
		if !host.accept(request) {
			continue;
		}
		match host.rewrite(request).await {
			Some(url) => request.url = url,
			None => return Ok(ChainOutcome::Silent),
		}
		if !materialized {
			// payload octets are consumable; pull them off the stream
			// exactly once, before the first respond
			materialize(
				stream,
				&mut request.files,
				&mut request.scratch,
				settings.read_timeout,
			)
			.await?;
			materialized = true;
		}
		match host.respond(request).await {
			Ok(Some(response)) => return Ok(ChainOutcome::Response(response)),
			Ok(None) => (),
			Err(e) => return Err(ServerError::HostFailure(e)),
		}
	}
	Ok(ChainOutcome::Response(Response::with_status(
		Status::NotFound,
	)))
}

async fn send<S>(
	stream: &mut S,
	response: Response,
	extended: bool,
	settings: &PipelineSettings,
) -> Result<()>
where
	S: AsyncWrite + Unpin + Send,
{
	if let Err(e) = write_response(stream, response, extended, settings.write_timeout).await {
		// a failed error report is logged and swallowed
		debug!(error = %e, "response could not be written");
	}
	Ok(())
}
