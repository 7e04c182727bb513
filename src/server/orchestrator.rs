use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::certs::store;
use crate::error::{Result, ServerError};
use crate::hosts::{Host, HostChain};
use crate::server::{Listener, PipelineSettings};
use crate::tls::{TlsSettings, TlsTerminator};

/// One listener, as configured on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
	/// Bind endpoint, `IP:PORT`.
	pub listen: String,
	/// Host pattern to certificate source (path or key-store thumbprint).
	#[serde(default)]
	pub server_certificates: BTreeMap<String, String>,
	/// Fail handshakes without a client certificate.
	#[serde(default)]
	pub require_client_certificate: bool,
}

/// Reads the listener configuration file (a JSON array).
///
/// # Errors
/// Fails on I/O and parse errors, and on an empty array.
pub fn load_listener_configs(path: &Path) -> Result<Vec<ListenerConfig>> {
	let text = std::fs::read_to_string(path)?;
	let configs: Vec<ListenerConfig> = serde_json::from_str(&text)
		.map_err(|e| ServerError::Config(format!("listener config: {e}")))?;
	match configs.is_empty() {
		true => Err(ServerError::Config(format!(
			"listener config {} defines no listeners",
			path.display()
		))),
		false => Ok(configs),
	}
}

/// The running server: every listener plus the shared host chain.
pub struct Server {
	listeners: Vec<Listener>,
	chain: Arc<HostChain>,
}

impl Server {
	/// Builds the chain, resolves certificates, and starts every listener
	/// in parallel. Listeners that fail to come up are logged and skipped;
	/// the server only starts if at least one survives.
	///
	/// # Errors
	/// Fails when the chain has no usable hosts or every listener failed.
	pub async fn start(
		configs: Vec<ListenerConfig>,
		hosts: Vec<Box<dyn Host>>,
		base_dir: &Path,
		settings: PipelineSettings,
	) -> Result<Server> {
		let chain = Arc::new(HostChain::build(hosts).await?);
		let settings = Arc::new(settings);
		let attempts = configs.into_iter().map(|config| {
			let chain = chain.clone();
			let settings = settings.clone();
			async move {
				let listen = config.listen.clone();
				start_listener(config, chain, settings, base_dir)
					.await
					.map_err(|e| (listen, e))
			}
		});
		let mut listeners = Vec::new();
		for outcome in join_all(attempts).await {
			match outcome {
				Ok(listener) => listeners.push(listener),
				Err((listen, e)) => error!(listen = %listen, error = %e, "listener failed to start"),
			}
		}
		if listeners.is_empty() {
			// nothing is serving; unwind the hosts and report
			chain.stop_all().await;
			chain.dispose_all().await;
			return Err(ServerError::Config(
				"every configured listener failed to start".to_string(),
			));
		}
		info!(count = listeners.len(), "server started");
		Ok(Server { listeners, chain })
	}

	/// The addresses actually bound.
	#[must_use]
	pub fn local_addrs(&self) -> Vec<SocketAddr> {
		self.listeners.iter().map(Listener::local_addr).collect()
	}

	/// Orderly shutdown: listeners first, then hosts are stopped in
	/// parallel, then disposed.
	pub async fn stop(self) {
		join_all(self.listeners.into_iter().map(Listener::stop)).await;
		self.chain.stop_all().await;
		self.chain.dispose_all().await;
		info!("server stopped");
	}
}

async fn start_listener(
	config: ListenerConfig,
	chain: Arc<HostChain>,
	settings: Arc<PipelineSettings>,
	base_dir: &Path,
) -> Result<Listener> {
	let addr: SocketAddr = config.listen.parse().map_err(|_| {
		ServerError::Config(format!("bind endpoint {:?} is not IP:PORT", config.listen))
	})?;
	let certificates = store::resolve_certificates(&config.server_certificates, base_dir)?;
	let tls = TlsTerminator::new(TlsSettings {
		certificates,
		require_client_certificate: config.require_client_certificate,
	})?;
	Listener::bind(addr, Arc::new(tls), chain, settings).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn listener_config_parses_the_documented_shape() {
		let text = r#"[
			{
				"listen": "127.0.0.1:1965",
				"serverCertificates": { "example.org": "example.pem" },
				"requireClientCertificate": true
			},
			{ "listen": "[::1]:1965" }
		]"#;
		let configs: Vec<ListenerConfig> = serde_json::from_str(text).unwrap();
		assert_eq!(configs.len(), 2);
		assert_eq!(configs[0].listen, "127.0.0.1:1965");
		assert!(configs[0].require_client_certificate);
		assert_eq!(
			configs[0].server_certificates.get("example.org").unwrap(),
			"example.pem"
		);
		assert!(!configs[1].require_client_certificate);
		assert!(configs[1].server_certificates.is_empty());
	}

	#[test]
	fn empty_listener_file_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("listeners.json");
		std::fs::write(&path, "[]").unwrap();
		assert!(load_listener_configs(&path).is_err());
	}
}
