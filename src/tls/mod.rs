//! The TLS terminator.
//!
//! Performs the server-side handshake with SNI-driven certificate
//! selection, offers the `GEMINI` ALPN protocol, and captures the client
//! certificate without validating its chain. Trust is the application
//! layer's problem (TOFU); the handshake only decides whether a client
//! certificate must be present at all.

use std::sync::Arc;
use std::time::Duration;

use pki_types::{CertificateDer, UnixTime};
use rustls::crypto::ring;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::certs::{CertificateIdentity, ClientCertificate};
use crate::error::{Result, ServerError};

/// ALPN protocol identifier offered during the handshake.
pub const ALPN_PROTOCOL: &[u8] = b"GEMINI";

/// Default bound for each blocking TLS or stream operation.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// What a listener needs to terminate TLS.
pub struct TlsSettings {
	/// `(host pattern, identity)` pairs for the SNI resolver. Patterns are
	/// probed as `HOST`, then `*.HOST`, then `*`.
	pub certificates: Vec<(String, CertificateIdentity)>,
	/// Fail handshakes that present no client certificate.
	pub require_client_certificate: bool,
}

/// Picks the server certificate for a handshake.
///
/// One entry and no SNI uses that entry; with SNI the patterns are probed
/// exactly (`HOST`, `*.HOST`, `*`); anything else falls back to the first
/// entry.
struct SniResolver {
	entries: Vec<(String, Arc<CertifiedKey>)>,
}

impl SniResolver {
	fn build(certificates: Vec<(String, CertificateIdentity)>) -> Result<SniResolver> {
		let provider = ring::default_provider();
		let mut entries = Vec::with_capacity(certificates.len());
		for (pattern, identity) in certificates {
			let key = identity.key.as_ref().ok_or_else(|| {
				ServerError::Config(format!("certificate for {pattern:?} has no private key"))
			})?;
			let signing_key = provider
				.key_provider
				.load_private_key(key.clone_key())
				.map_err(|e| {
					ServerError::Config(format!("key for {pattern:?} is unusable: {e}"))
				})?;
			let chain = vec![CertificateDer::from(identity.der.clone())];
			entries.push((
				pattern.to_ascii_lowercase(),
				Arc::new(CertifiedKey::new(chain, signing_key)),
			));
		}
		match entries.is_empty() {
			true => Err(ServerError::Config(
				"a listener needs at least one server certificate".to_string(),
			)),
			false => Ok(SniResolver { entries }),
		}
	}

	fn probe(&self, pattern: &str) -> Option<Arc<CertifiedKey>> {
		self.entries
			.iter()
			.find(|(p, _)| p == pattern)
			.map(|(_, key)| key.clone())
	}

	fn lookup(&self, sni: Option<&str>) -> Arc<CertifiedKey> {
		if let Some(host) = sni {
			let host = host.to_ascii_lowercase();
			if let Some(key) = self
				.probe(&host)
				.or_else(|| self.probe(&format!("*.{host}")))
				.or_else(|| self.probe("*"))
			{
				return key;
			}
		}
		// no SNI, or nothing matched: the first entry serves
		self.entries[0].1.clone()
	}
}

impl std::fmt::Debug for SniResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_list()
			.entries(self.entries.iter().map(|(p, _)| p))
			.finish()
	}
}

impl ResolvesServerCert for SniResolver {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		Some(self.lookup(client_hello.server_name()))
	}
}

/// Accepts any client certificate without touching its chain; rejection
/// happens at the application layer against thumbprint ACLs.
#[derive(Debug)]
struct TofuClientVerifier {
	mandatory: bool,
	schemes: Vec<SignatureScheme>,
}

impl TofuClientVerifier {
	fn new(mandatory: bool) -> TofuClientVerifier {
		TofuClientVerifier {
			mandatory,
			schemes: ring::default_provider()
				.signature_verification_algorithms
				.supported_schemes(),
		}
	}
}

impl ClientCertVerifier for TofuClientVerifier {
	fn offer_client_auth(&self) -> bool {
		true
	}

	fn client_auth_mandatory(&self) -> bool {
		self.mandatory
	}

	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		&[]
	}

	fn verify_client_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_now: UnixTime,
	) -> std::result::Result<ClientCertVerified, rustls::Error> {
		Ok(ClientCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.schemes.clone()
	}
}

/// Wraps accepted sockets in TLS and hands back the decrypted stream plus
/// the captured client certificate.
pub struct TlsTerminator {
	acceptor: TlsAcceptor,
	handshake_timeout: Duration,
}

impl TlsTerminator {
	/// Builds the rustls server config: TLS 1.2/1.3, the SNI resolver, the
	/// TOFU client verifier and the `GEMINI` ALPN offer.
	///
	/// # Errors
	/// Fails when no usable certificate is configured.
	pub fn new(settings: TlsSettings) -> Result<TlsTerminator> {
		let resolver = SniResolver::build(settings.certificates)?;
		let verifier = TofuClientVerifier::new(settings.require_client_certificate);
		let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
			ring::default_provider(),
		))
		.with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
		.map_err(|e| ServerError::Config(format!("TLS versions rejected: {e}")))?
		.with_client_cert_verifier(Arc::new(verifier))
		.with_cert_resolver(Arc::new(resolver));
		config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
		Ok(TlsTerminator {
			acceptor: TlsAcceptor::from(Arc::new(config)),
			handshake_timeout: DEFAULT_IO_TIMEOUT,
		})
	}

	/// Performs the handshake on an accepted socket.
	///
	/// # Errors
	/// `TlsFailure` on handshake errors and timeouts. Nothing is written
	/// to the peer; the caller just closes.
	pub async fn terminate(
		&self,
		socket: TcpStream,
	) -> Result<(TlsStream<TcpStream>, Option<ClientCertificate>)> {
		let stream = timeout(self.handshake_timeout, self.acceptor.accept(socket))
			.await
			.map_err(|_| {
				ServerError::TlsFailure(std::io::Error::new(
					std::io::ErrorKind::TimedOut,
					"handshake timed out",
				))
			})?
			.map_err(ServerError::TlsFailure)?;
		let client_cert = stream
			.get_ref()
			.1
			.peer_certificates()
			.and_then(|chain| chain.first())
			.map(ClientCertificate::capture);
		Ok((stream, client_cert))
	}
}
