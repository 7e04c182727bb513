//! Certificate identities and the PEM plumbing around them.
//!
//! Certificates are handled as raw DER plus a handful of parsed fields; the
//! protocol does trust-on-first-use at the application layer, so the only
//! stable identifier anything needs is the SHA-1 thumbprint of the DER.

pub mod keygen;
pub mod store;

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use pki_types::{CertificateDer, PrivateKeyDer};
use sha1::{Digest, Sha1};
use x509_parser::prelude::parse_x509_certificate;

use crate::error::{Result, ServerError};

/// Hex SHA-1 over a certificate's DER encoding, 40 characters, lower case.
#[must_use]
pub fn thumbprint_of(der: &[u8]) -> String {
	let mut hasher = Sha1::new();
	hasher.update(der);
	hex::encode(hasher.finalize())
}

/// A client certificate captured during the handshake.
///
/// Never chain-validated; the raw DER and its thumbprint are all the
/// application layer compares.
#[derive(Clone)]
pub struct ClientCertificate {
	/// Raw DER encoding as presented by the peer.
	pub der: Vec<u8>,
	/// Hex SHA-1 thumbprint of the DER.
	pub thumbprint: String,
	/// Parsed subject, or empty when the certificate does not parse.
	pub subject: String,
}

impl ClientCertificate {
	/// Captures a peer certificate. The subject is best-effort; a garbled
	/// certificate still yields a usable thumbprint.
	#[must_use]
	pub fn capture(der: &CertificateDer<'_>) -> ClientCertificate {
		let der = der.as_ref().to_vec();
		let thumbprint = thumbprint_of(&der);
		let subject = match parse_x509_certificate(&der) {
			Ok((_, cert)) => cert.subject().to_string(),
			Err(_) => String::new(),
		};
		ClientCertificate {
			der,
			thumbprint,
			subject,
		}
	}

	/// Case-insensitive thumbprint comparison.
	#[must_use]
	pub fn matches_thumbprint(&self, other: &str) -> bool {
		self.thumbprint.eq_ignore_ascii_case(other.trim())
	}
}

impl fmt::Debug for ClientCertificate {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("ClientCertificate")
			.field("thumbprint", &self.thumbprint)
			.field("subject", &self.subject)
			.finish_non_exhaustive()
	}
}

/// A server certificate together with the fields the pipeline cares about
/// and, when available, its private key.
pub struct CertificateIdentity {
	/// Raw DER encoding.
	pub der: Vec<u8>,
	/// Parsed subject.
	pub subject: String,
	/// Start of the validity window, seconds since the Unix epoch.
	pub not_before: i64,
	/// End of the validity window, seconds since the Unix epoch.
	pub not_after: i64,
	/// Hex SHA-1 thumbprint of the DER.
	pub thumbprint: String,
	/// DER SubjectPublicKeyInfo, as exported into the PUBLIC KEY block.
	pub public_key: Vec<u8>,
	/// Private key, present for identities this server can serve with.
	pub key: Option<PrivateKeyDer<'static>>,
}

impl CertificateIdentity {
	/// Parses an identity out of certificate DER and an optional key.
	///
	/// # Errors
	/// Fails when the DER is not an X.509 certificate.
	pub fn from_der(der: Vec<u8>, key: Option<PrivateKeyDer<'static>>) -> Result<Self> {
		let (_, cert) = parse_x509_certificate(&der)
			.map_err(|e| ServerError::Config(format!("certificate does not parse: {e}")))?;
		let subject = cert.subject().to_string();
		let not_before = cert.validity().not_before.timestamp();
		let not_after = cert.validity().not_after.timestamp();
		let public_key = cert.public_key().raw.to_vec();
		let thumbprint = thumbprint_of(&der);
		Ok(CertificateIdentity {
			der,
			subject,
			not_before,
			not_after,
			thumbprint,
			public_key,
			key,
		})
	}

	/// Whether the validity window covers the given instant.
	#[must_use]
	pub fn is_valid_at(&self, unix_seconds: i64) -> bool {
		self.not_before <= unix_seconds && unix_seconds <= self.not_after
	}

	/// Whether the validity window covers the current wall clock.
	#[must_use]
	pub fn is_valid_now(&self) -> bool {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
			.unwrap_or(0);
		self.is_valid_at(now)
	}

	/// Case-insensitive thumbprint comparison.
	#[must_use]
	pub fn matches_thumbprint(&self, other: &str) -> bool {
		self.thumbprint.eq_ignore_ascii_case(other.trim())
	}

	/// Serializes the identity as PEM: a CERTIFICATE block, a PUBLIC KEY
	/// block, and a private key block when a key is attached.
	#[must_use]
	pub fn to_pem(&self) -> String {
		let mut out = pem_block("CERTIFICATE", &self.der);
		out.push_str(&pem_block("PUBLIC KEY", &self.public_key));
		if let Some(key) = &self.key {
			let (label, der) = match key {
				PrivateKeyDer::Pkcs8(k) => ("PRIVATE KEY", k.secret_pkcs8_der()),
				PrivateKeyDer::Pkcs1(k) => ("RSA PRIVATE KEY", k.secret_pkcs1_der()),
				PrivateKeyDer::Sec1(k) => ("EC PRIVATE KEY", k.secret_sec1_der()),
				_ => ("PRIVATE KEY", &[] as &[u8]),
			};
			if !der.is_empty() {
				out.push_str(&pem_block(label, der));
			}
		}
		out
	}

	/// Reads an identity back out of PEM text.
	///
	/// # Errors
	/// Fails when no CERTIFICATE block is present, or when the key block is
	/// encrypted (password-protected keys are not usable here).
	pub fn from_pem(pem: &str) -> Result<Self> {
		let mut reader = BufReader::new(pem.as_bytes());
		let mut cert: Option<Vec<u8>> = None;
		let mut key: Option<PrivateKeyDer<'static>> = None;
		for item in rustls_pemfile::read_all(&mut reader) {
			let item =
				item.map_err(|e| ServerError::Config(format!("unreadable PEM block: {e}")))?;
			match item {
				rustls_pemfile::Item::X509Certificate(der) if cert.is_none() => {
					cert = Some(der.as_ref().to_vec());
				}
				rustls_pemfile::Item::Pkcs8Key(der) if key.is_none() => {
					key = Some(PrivateKeyDer::Pkcs8(der));
				}
				rustls_pemfile::Item::Pkcs1Key(der) if key.is_none() => {
					key = Some(PrivateKeyDer::Pkcs1(der));
				}
				rustls_pemfile::Item::Sec1Key(der) if key.is_none() => {
					key = Some(PrivateKeyDer::Sec1(der));
				}
				_ => (),
			}
		}
		let der = cert.ok_or_else(|| {
			ServerError::Config("PEM input carries no CERTIFICATE block".to_string())
		})?;
		CertificateIdentity::from_der(der, key)
	}

	/// Reads an identity from a PEM file on disk.
	///
	/// # Errors
	/// Fails on I/O errors and on the conditions of [`Self::from_pem`].
	pub fn from_pem_file(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path)?;
		CertificateIdentity::from_pem(&text)
	}
}

impl fmt::Debug for CertificateIdentity {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("CertificateIdentity")
			.field("subject", &self.subject)
			.field("thumbprint", &self.thumbprint)
			.field("has_key", &self.key.is_some())
			.finish_non_exhaustive()
	}
}

fn pem_block(label: &str, der: &[u8]) -> String {
	let encoded = base64::encode(der);
	let mut out = format!("-----BEGIN {label}-----\n");
	for chunk in encoded.as_bytes().chunks(64) {
		// chunks of a valid base64 string stay valid UTF-8
		out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
		out.push('\n');
	}
	out.push_str(&format!("-----END {label}-----\n"));
	out
}
