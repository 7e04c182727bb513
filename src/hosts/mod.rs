//! The host contract and the chain that dispatches requests to hosts.
//!
//! A host is the unit of request handling: it filters (`accept`), may
//! replace the URL (`rewrite`), and may answer (`respond`). A listener owns
//! one chain of hosts, built once, sorted by priority, and walked per
//! request until a host answers.

mod spec;
mod static_files;
pub use spec::*;
pub use static_files::*;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};
use url::Url;

use crate::error::{Result, ServerError};
use crate::net::IpRange;
use crate::server::Request;
use crate::wire::Response;

/// Default priority for user hosts. Lower runs earlier.
pub const DEFAULT_PRIORITY: u16 = 0x1000;

/// Lowest priority reserved for internal hosts.
pub const RESERVED_PRIORITY_START: u16 = 0xFF00;

/// Highest priority reserved for internal hosts.
pub const RESERVED_PRIORITY_END: u16 = 0xFFFE;

/// A polymorphic request handler.
///
/// Implementations are shared across connection workers, so request-scoped
/// state belongs on the [`Request`], not the host. Lifecycle: `start` is
/// called exactly once before the first request; hosts that refuse or fail
/// are disposed and dropped from the chain. `stop` then `dispose` run once
/// at shutdown.
#[async_trait]
pub trait Host: Send + Sync {
	/// Chain position; lower runs earlier. `0xFF00..=0xFFFE` is reserved
	/// for internal hosts.
	fn priority(&self) -> u16 {
		DEFAULT_PRIORITY
	}

	/// Stable name used to break priority ties deterministically.
	fn type_name(&self) -> &'static str;

	/// Hostname patterns this host answers for; empty accepts all.
	fn host_specs(&self) -> &[HostSpec] {
		&[]
	}

	/// Remote ranges this host answers for; empty accepts all.
	fn remote_ranges(&self) -> &[IpRange] {
		&[]
	}

	/// One-time startup. Returning `false` or an error discards the host.
	///
	/// # Errors
	/// Any error is treated like `false`, with the cause logged.
	async fn start(&self) -> anyhow::Result<bool> {
		Ok(true)
	}

	/// Stops serving. Called once, after the listener stops accepting.
	async fn stop(&self) {}

	/// Releases resources. Called once, last.
	async fn dispose(&self) {}

	/// Whether this host wants the request at all.
	fn accept(&self, request: &Request) -> bool {
		let specs = self.host_specs();
		let specs_ok = specs.is_empty() || specs.iter().any(|s| s.matches_url(&request.url));
		let ranges = self.remote_ranges();
		let ranges_ok =
			ranges.is_empty() || ranges.iter().any(|r| r.contains(request.remote.ip()));
		specs_ok && ranges_ok
	}

	/// Transforms the URL before `respond`. `None` terminates the request
	/// with no response at all.
	async fn rewrite(&self, request: &Request) -> Option<Url> {
		Some(request.url.clone())
	}

	/// Produces a response, or `None` to pass the request on down the
	/// chain.
	///
	/// # Errors
	/// Errors become a code-42 response carrying the flattened context
	/// chain.
	async fn respond(&self, request: &mut Request) -> anyhow::Result<Option<Response>>;
}

/// What walking the chain produced.
#[derive(Debug)]
pub enum ChainOutcome {
	/// A host answered (or the chain was exhausted and 51 was synthesized).
	Response(Response),
	/// A rewrite returned `None`: close with no response.
	Silent,
}

/// The per-listener, immutable, priority-ordered list of started hosts.
pub struct HostChain {
	hosts: Vec<Box<dyn Host>>,
}

impl HostChain {
	/// Sorts hosts, starts each exactly once, and disposes the ones that
	/// refuse to start.
	///
	/// # Errors
	/// Fails when no host survives startup; a pipeline without hosts
	/// cannot answer anything.
	pub async fn build(mut hosts: Vec<Box<dyn Host>>) -> Result<HostChain> {
		hosts.sort_by(|a, b| {
			(a.priority(), a.type_name()).cmp(&(b.priority(), b.type_name()))
		});
		let mut kept = Vec::with_capacity(hosts.len());
		for host in hosts {
			match host.start().await {
				Ok(true) => kept.push(host),
				Ok(false) => {
					info!(host = host.type_name(), "host declined to start, discarding");
					host.dispose().await;
				}
				Err(e) => {
					warn!(host = host.type_name(), error = %format!("{e:#}"), "host failed to start, discarding");
					host.dispose().await;
				}
			}
		}
		match kept.is_empty() {
			true => Err(ServerError::Config(
				"no host in the chain survived startup".to_string(),
			)),
			false => Ok(HostChain { hosts: kept }),
		}
	}

	/// The started hosts in chain order.
	#[must_use]
	pub fn hosts(&self) -> &[Box<dyn Host>] {
		&self.hosts
	}

	/// Number of started hosts.
	#[must_use]
	pub fn len(&self) -> usize {
		self.hosts.len()
	}

	/// Whether the chain is empty (never true for a built chain).
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.hosts.is_empty()
	}

	/// Stops every host, in parallel.
	pub async fn stop_all(&self) {
		join_all(self.hosts.iter().map(|h| h.stop())).await;
	}

	/// Disposes every host, in parallel. Runs after [`Self::stop_all`].
	pub async fn dispose_all(&self) {
		join_all(self.hosts.iter().map(|h| h.dispose())).await;
	}
}

impl std::fmt::Debug for HostChain {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_list()
			.entries(self.hosts.iter().map(|h| h.type_name()))
			.finish()
	}
}
