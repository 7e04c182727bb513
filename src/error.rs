//! The error vocabulary shared by the request pipeline.

use thiserror::Error;

/// Everything that can go wrong between `accept()` and the closing flush.
#[derive(Error, Debug)]
pub enum ServerError {
	/// The TLS handshake did not complete.
	#[error("TLS handshake failed: {0}")]
	TlsFailure(#[source] std::io::Error),
	/// The request line was not a well-formed absolute URL.
	#[error("malformed request: {0}")]
	MalformedRequest(String),
	/// The request line overran the configured cap.
	#[error("request line exceeds {0} octets")]
	TooLarge(usize),
	/// A form declared file indices that do not form the sequence `1..N`,
	/// or was otherwise undecodable.
	#[error("malformed form: {0}")]
	MalformedForm(String),
	/// The stream ended before a declared file payload was complete.
	#[error("request body ended after {got} of {expected} octets")]
	TruncatedBody {
		/// Octets the form declared for the payload.
		expected: u64,
		/// Octets actually read before the stream ended.
		got: u64,
	},
	/// A host returned an error from `respond`.
	#[error("host failure")]
	HostFailure(#[source] anyhow::Error),
	/// Path traversal or an I/O failure while touching the filesystem.
	#[error("filesystem error: {0}")]
	Filesystem(#[from] std::io::Error),
	/// A client certificate was required and missing, or not on the ACL.
	#[error("client certificate rejected")]
	CertificateRejected,
	/// A configuration file or value could not be used.
	#[error("configuration error: {0}")]
	Config(String),
}

impl ServerError {
	/// Flattens a host failure's context chain into a single status line,
	/// the way CGI errors are reported on the wire.
	#[must_use]
	pub fn chain_message(&self) -> String {
		match self {
			ServerError::HostFailure(inner) => format!("{inner:#}"),
			other => other.to_string(),
		}
	}
}

/// Result alias used throughout the crate.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;
