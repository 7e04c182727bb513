//! Building the per-listener certificate set out of configuration.
//!
//! Each listener config maps a host pattern to a certificate source. A
//! source is tried as a path, then as an absolute path under the config
//! directory; a 40-hex-digit source names an OS key-store thumbprint, which
//! only exists on platforms with such a store. When nothing resolves, the
//! listener falls back to a generated developer certificate persisted under
//! [`keygen::DEVELOPER_CERT_FILE`].

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use crate::certs::{keygen, CertificateIdentity};
use crate::error::{Result, ServerError};

fn looks_like_thumbprint(s: &str) -> bool {
	s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn load_source(source: &str, base_dir: &Path) -> Option<Result<CertificateIdentity>> {
	let direct = Path::new(source);
	if direct.is_file() {
		return Some(CertificateIdentity::from_pem_file(direct));
	}
	let qualified = base_dir.join(source);
	if qualified.is_file() {
		return Some(CertificateIdentity::from_pem_file(&qualified));
	}
	None
}

/// Loads the developer certificate, generating and persisting it when it is
/// missing or no longer valid.
///
/// # Errors
/// Fails when generation fails or the file cannot be written.
pub fn developer_certificate(base_dir: &Path) -> Result<CertificateIdentity> {
	let path = base_dir.join(keygen::DEVELOPER_CERT_FILE);
	if path.is_file() {
		match CertificateIdentity::from_pem_file(&path) {
			Ok(identity) if identity.is_valid_now() && identity.key.is_some() => {
				return Ok(identity)
			}
			Ok(_) => info!(path = %path.display(), "developer certificate expired, regenerating"),
			Err(e) => warn!(path = %path.display(), error = %e, "developer certificate unreadable, regenerating"),
		}
	}
	let identity = keygen::developer_identity("localhost")?;
	std::fs::write(&path, identity.to_pem())?;
	info!(path = %path.display(), thumbprint = %identity.thumbprint, "generated developer certificate");
	Ok(identity)
}

/// Resolves a listener's `serverCertificates` map into `(pattern, identity)`
/// pairs for the SNI resolver.
///
/// An empty map resolves to the developer certificate under the `*` pattern.
///
/// # Errors
/// Fails when a configured file exists but cannot be parsed, or when the
/// developer fallback cannot be produced.
pub fn resolve_certificates(
	map: &BTreeMap<String, String>,
	base_dir: &Path,
) -> Result<Vec<(String, CertificateIdentity)>> {
	if map.is_empty() {
		return Ok(vec![("*".to_string(), developer_certificate(base_dir)?)]);
	}
	let mut out = Vec::with_capacity(map.len());
	for (pattern, source) in map {
		let identity = match load_source(source, base_dir) {
			Some(loaded) => {
				let identity = loaded?;
				if identity.key.is_none() {
					return Err(ServerError::Config(format!(
						"certificate {source:?} for {pattern:?} has no private key"
					)));
				}
				identity
			}
			None if looks_like_thumbprint(source) => {
				// No OS key store on this platform; treat like a missing file.
				warn!(
					pattern = %pattern,
					source = %source,
					"key-store thumbprints are not available here, using developer certificate"
				);
				developer_certificate(base_dir)?
			}
			None => {
				warn!(
					pattern = %pattern,
					source = %source,
					"certificate source not found, using developer certificate"
				);
				developer_certificate(base_dir)?
			}
		};
		if !identity.is_valid_now() {
			warn!(pattern = %pattern, thumbprint = %identity.thumbprint, "serving an expired certificate");
		}
		out.push((pattern.clone(), identity));
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_map_falls_back_to_developer_certificate() {
		let dir = tempfile::tempdir().unwrap();
		let map = BTreeMap::new();
		let set = resolve_certificates(&map, dir.path()).unwrap();
		assert_eq!(set.len(), 1);
		assert_eq!(set[0].0, "*");
		assert!(dir.path().join(keygen::DEVELOPER_CERT_FILE).is_file());
	}

	#[test]
	fn developer_certificate_is_reused_once_persisted() {
		let dir = tempfile::tempdir().unwrap();
		let first = developer_certificate(dir.path()).unwrap();
		let second = developer_certificate(dir.path()).unwrap();
		assert_eq!(first.thumbprint, second.thumbprint);
	}

	#[test]
	fn configured_file_is_loaded_for_its_pattern() {
		let dir = tempfile::tempdir().unwrap();
		let identity = keygen::developer_identity("vhost.test").unwrap();
		let path = dir.path().join("vhost.pem");
		std::fs::write(&path, identity.to_pem()).unwrap();
		let mut map = BTreeMap::new();
		map.insert(
			"vhost.test".to_string(),
			path.to_string_lossy().into_owned(),
		);
		let set = resolve_certificates(&map, dir.path()).unwrap();
		assert_eq!(set.len(), 1);
		assert_eq!(set[0].1.thumbprint, identity.thumbprint);
	}

	#[test]
	fn unresolvable_thumbprint_source_degrades_to_developer_certificate() {
		let dir = tempfile::tempdir().unwrap();
		let mut map = BTreeMap::new();
		map.insert(
			"*".to_string(),
			"00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff".to_string(),
		);
		let set = resolve_certificates(&map, dir.path()).unwrap();
		assert_eq!(set.len(), 1);
		assert!(set[0].1.key.is_some());
	}
}
