use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hosts::HostChain;
use crate::server::{pipeline, PipelineSettings};
use crate::tls::TlsTerminator;

/// How long a stopping listener waits for in-flight workers before
/// aborting them.
const DRAIN_WAIT: Duration = Duration::from_secs(10);

/// One bound socket with its acceptor task.
///
/// Accepting runs until [`Listener::stop`]; each accepted connection gets
/// its own worker task that terminates TLS and runs the pipeline.
pub struct Listener {
	local: SocketAddr,
	stop: watch::Sender<bool>,
	acceptor: JoinHandle<()>,
}

impl Listener {
	/// Binds the address and starts accepting.
	///
	/// # Errors
	/// Fails when the socket cannot be bound.
	pub async fn bind(
		addr: SocketAddr,
		tls: Arc<TlsTerminator>,
		chain: Arc<HostChain>,
		settings: Arc<PipelineSettings>,
	) -> Result<Listener> {
		let socket = TcpListener::bind(addr).await?;
		let local = socket.local_addr()?;
		let (stop, mut stopped) = watch::channel(false);
		let acceptor = tokio::spawn(async move {
			let mut workers: JoinSet<()> = JoinSet::new();
			loop {
				tokio::select! {
					_ = stopped.changed() => break,
					accepted = socket.accept() => match accepted {
						Ok((tcp, remote)) => {
							let tls = tls.clone();
							let chain = chain.clone();
							let settings = settings.clone();
							workers.spawn(async move {
								match tls.terminate(tcp).await {
									Ok((stream, client_cert)) => {
										pipeline::serve(
											stream,
											remote,
											client_cert,
											&chain,
											&settings,
										)
										.await;
									}
									Err(e) => {
										debug!(%remote, error = %e, "handshake failed");
									}
								}
							});
						}
						Err(e) => {
							warn!(%local, error = %e, "accept failed");
						}
					},
				}
				// reap workers that already finished
				while workers.try_join_next().is_some() {}
			}
			// closing the socket stops new connections; in-flight workers
			// get a bounded grace period
			drop(socket);
			let drain = async {
				while workers.join_next().await.is_some() {}
			};
			if timeout(DRAIN_WAIT, drain).await.is_err() {
				warn!(%local, "workers still running at the drain deadline, aborting them");
				workers.shutdown().await;
			}
			info!(%local, "listener stopped");
		});
		info!(%local, "listening");
		Ok(Listener {
			local,
			stop,
			acceptor,
		})
	}

	/// The address actually bound (useful with port 0).
	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.local
	}

	/// Stops accepting, drains workers, and waits for the acceptor task.
	pub async fn stop(self) {
		let _ = self.stop.send(true);
		let _ = self.acceptor.await;
	}
}
