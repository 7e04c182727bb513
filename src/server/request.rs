use std::net::SocketAddr;

use url::Url;
use uuid::Uuid;

use crate::certs::ClientCertificate;
use crate::forms::{FileUpload, Form, ScratchDir};

/// Everything a connection worker knows about one request.
///
/// Owned exclusively by the worker; dropping it tears the scratch directory
/// down with it.
#[derive(Debug)]
pub struct Request {
	/// Unique identifier, also the name of the scratch directory.
	pub id: Uuid,
	/// The request URL; a host rewrite replaces it.
	pub url: Url,
	/// The peer's address and port.
	pub remote: SocketAddr,
	/// Client certificate captured during the handshake, if any.
	pub client_cert: Option<ClientCertificate>,
	/// The decoded form: URL query, or in body mode the ingested body form.
	pub form: Form,
	/// Declared uploads, in ascending index order.
	pub files: Vec<FileUpload>,
	/// Scratch space for large payloads.
	pub scratch: ScratchDir,
}

impl Request {
	/// Builds the request state for a parsed URL, decoding the query into
	/// the initial form.
	#[must_use]
	pub fn new(url: Url, remote: SocketAddr, client_cert: Option<ClientCertificate>) -> Request {
		let id = Uuid::new_v4();
		let form = url.query().map(Form::decode).unwrap_or_default();
		Request {
			id,
			url,
			remote,
			client_cert,
			form,
			files: Vec::new(),
			scratch: ScratchDir::for_request(id),
		}
	}

	/// Thumbprint of the client certificate, when one was captured.
	#[must_use]
	pub fn client_thumbprint(&self) -> Option<&str> {
		self.client_cert.as_ref().map(|c| c.thumbprint.as_str())
	}
}
