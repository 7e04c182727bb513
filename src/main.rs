use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gemplus::hosts::{Host, StaticFilesHost};
use gemplus::limiter::Limiter;
use gemplus::server::{load_listener_configs, ListenerConfig, PipelineSettings, Server};

#[derive(structopt::StructOpt)]
struct Opts {
	/// The listener configuration file (JSON).
	/// When the file does not exist, one listener per address family is
	/// bound on port 1965 with a generated developer certificate.
	#[structopt(short, long, default_value = "listeners.json", env = "GEMPLUS_LISTENERS")]
	listeners: PathBuf,
	/// The static site configuration file (JSON).
	#[structopt(short, long, env = "GEMPLUS_SITES")]
	sites: Option<PathBuf>,
	/// Serve a single directory on every host name instead of --sites.
	#[structopt(short, long)]
	root: Option<PathBuf>,
	/// Maximum number of concurrently admitted requests.
	#[structopt(long, default_value = "256")]
	admission_limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gemplus=info")),
		)
		.init();

	let opt = Opts::from_args();

	let configs = match opt.listeners.is_file() {
		true => load_listener_configs(&opt.listeners)?,
		false => {
			info!(
				path = %opt.listeners.display(),
				"no listener config, binding the defaults"
			);
			vec![
				ListenerConfig {
					listen: "0.0.0.0:1965".to_string(),
					server_certificates: Default::default(),
					require_client_certificate: false,
				},
				ListenerConfig {
					listen: "[::]:1965".to_string(),
					server_certificates: Default::default(),
					require_client_certificate: false,
				},
			]
		}
	};

	let mut hosts: Vec<Box<dyn Host>> = Vec::new();
	match (&opt.sites, &opt.root) {
		(Some(sites), _) => hosts.push(Box::new(StaticFilesHost::load(sites)?)),
		(None, Some(root)) => {
			hosts.push(Box::new(StaticFilesHost::single_root(root.clone())?));
		}
		(None, None) => anyhow::bail!("one of --sites or --root is required"),
	}

	let settings = PipelineSettings {
		admission: Some(Arc::new(Limiter::new(opt.admission_limit))),
		..PipelineSettings::default()
	};
	let base_dir = opt
		.listeners
		.parent()
		.filter(|p| !p.as_os_str().is_empty())
		.unwrap_or_else(|| Path::new("."))
		.to_path_buf();

	let server = Server::start(configs, hosts, &base_dir, settings).await?;
	info!(addrs = ?server.local_addrs(), "ready");

	tokio::signal::ctrl_c().await?;
	info!("interrupt received, shutting down");
	server.stop().await;
	Ok(())
}
