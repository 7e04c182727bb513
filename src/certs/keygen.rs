//! The embedded developer-certificate generator.
//!
//! Real deployments bring their own certificates; this exists so a bare
//! checkout can answer TLS at all. The generated identity is self-signed,
//! valid for one year, and persisted next to the config as `server.crt`.

use pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rcgen::{CertificateParams, DnType, KeyPair};
use time::{Duration, OffsetDateTime};

use crate::certs::CertificateIdentity;
use crate::error::{Result, ServerError};

/// File name the orchestrator persists the generated identity under.
pub const DEVELOPER_CERT_FILE: &str = "server.crt";

/// Generates a fresh self-signed identity for the given name.
///
/// The validity window opens a day in the past so clock skew between the
/// server and a client does not make a brand-new certificate unusable.
///
/// # Errors
/// Fails when key generation or self-signing fails.
pub fn developer_identity(common_name: &str) -> Result<CertificateIdentity> {
	let mut params = CertificateParams::new(vec![common_name.to_string()])
		.map_err(|e| ServerError::Config(format!("bad certificate name: {e}")))?;
	params
		.distinguished_name
		.push(DnType::CommonName, common_name);
	let now = OffsetDateTime::now_utc();
	params.not_before = now - Duration::days(1);
	params.not_after = now + Duration::days(365);

	let key_pair = KeyPair::generate()
		.map_err(|e| ServerError::Config(format!("key generation failed: {e}")))?;
	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| ServerError::Config(format!("self-signing failed: {e}")))?;

	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
	CertificateIdentity::from_der(cert.der().as_ref().to_vec(), Some(key))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn developer_identity_lasts_about_a_year() {
		let identity = developer_identity("dev.local").unwrap();
		let window = identity.not_after - identity.not_before;
		let days = window / 86_400;
		assert!((365..=367).contains(&days), "window was {days} days");
		assert!(identity.subject.contains("dev.local"));
	}
}
