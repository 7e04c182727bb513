use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use path_clean::PathClean;
use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::error::{Result, ServerError};
use crate::hosts::{Host, HostSpec};
use crate::net::IpRange;
use crate::server::Request;
use crate::wire::{mime_for_path, Body, Response, Status, GEMTEXT_MIME};

/// Characters escaped in directory-listing link targets.
/// <https://url.spec.whatwg.org/#path-percent-encode-set>
const LINK_SET: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'<')
	.add(b'>')
	.add(b'?')
	.add(b'`')
	.add(b'{')
	.add(b'}');

/// Index document served for a directory URL.
const INDEX_FILE: &str = "index.gmi";

/// One virtual-host entry of the static file host, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticSiteConfig {
	/// Directory served as the site root. Must exist.
	pub root_directory: PathBuf,
	/// Whether directories without an index render a listing.
	#[serde(default)]
	pub allow_directory_browsing: bool,
	/// Host specs this entry answers for; empty accepts all.
	#[serde(default)]
	pub hosts: Vec<String>,
	/// Remote ranges allowed to reach this entry; empty accepts all.
	#[serde(default)]
	pub remote_ranges: Vec<String>,
	/// Client-certificate thumbprints allowed in; empty means no ACL.
	#[serde(default)]
	pub thumbprints: Vec<String>,
}

struct SiteEntry {
	root: PathBuf,
	browse: bool,
	specs: Vec<HostSpec>,
	ranges: Vec<IpRange>,
	thumbprints: Vec<String>,
}

impl SiteEntry {
	fn matches_url(&self, url: &Url) -> bool {
		self.specs.is_empty() || self.specs.iter().any(|s| s.matches_url(url))
	}

	fn allows_remote(&self, request: &Request) -> bool {
		self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains(request.remote.ip()))
	}

	/// Maps a URL path under the entry root. The result must be the root
	/// itself or live strictly below it; anything else is an escape.
	fn map_path(&self, url_path: &str) -> Result<PathBuf> {
		let decoded = percent_decode_str(url_path).decode_utf8_lossy();
		let relative = decoded.trim_start_matches('/');
		let mapped = self.root.join(relative).clean();
		match mapped == self.root || mapped.starts_with(&self.root) {
			true => Ok(mapped),
			false => Err(ServerError::Filesystem(std::io::Error::new(
				std::io::ErrorKind::PermissionDenied,
				"path escapes the site root",
			))),
		}
	}
}

/// The built-in multi-virtual-host static file server.
pub struct StaticFilesHost {
	entries: Vec<SiteEntry>,
	priority: u16,
}

impl StaticFilesHost {
	/// Builds the host from configuration entries.
	///
	/// # Errors
	/// Fails when a root directory is missing or a spec, range or
	/// thumbprint does not parse.
	pub fn from_configs(configs: Vec<StaticSiteConfig>) -> Result<StaticFilesHost> {
		let mut entries = Vec::with_capacity(configs.len());
		for config in configs {
			let root = config.root_directory.canonicalize().map_err(|e| {
				ServerError::Config(format!(
					"root directory {:?} is unusable: {e}",
					config.root_directory
				))
			})?;
			let specs = config
				.hosts
				.iter()
				.map(|s| s.parse())
				.collect::<Result<Vec<HostSpec>>>()?;
			let ranges = config
				.remote_ranges
				.iter()
				.map(|s| s.parse())
				.collect::<Result<Vec<IpRange>>>()?;
			let thumbprints = config
				.thumbprints
				.iter()
				.map(|t| {
					let t = t.trim().to_ascii_lowercase();
					match t.len() == 40 && t.chars().all(|c| c.is_ascii_hexdigit()) {
						true => Ok(t),
						false => Err(ServerError::Config(format!(
							"thumbprint {t:?} is not 40 hex characters"
						))),
					}
				})
				.collect::<Result<Vec<String>>>()?;
			entries.push(SiteEntry {
				root,
				browse: config.allow_directory_browsing,
				specs,
				ranges,
				thumbprints,
			});
		}
		Ok(StaticFilesHost {
			entries,
			priority: crate::hosts::DEFAULT_PRIORITY,
		})
	}

	/// Loads configuration entries from a JSON file.
	///
	/// # Errors
	/// Fails on I/O and parse errors, and on the conditions of
	/// [`Self::from_configs`].
	pub fn load(path: &Path) -> Result<StaticFilesHost> {
		let text = std::fs::read_to_string(path)?;
		let configs: Vec<StaticSiteConfig> = serde_json::from_str(&text)
			.map_err(|e| ServerError::Config(format!("static host config: {e}")))?;
		StaticFilesHost::from_configs(configs)
	}

	/// Serves a single directory to every host name, browsing enabled.
	///
	/// # Errors
	/// Fails when the directory is missing.
	pub fn single_root(root: PathBuf) -> Result<StaticFilesHost> {
		StaticFilesHost::from_configs(vec![StaticSiteConfig {
			root_directory: root,
			allow_directory_browsing: true,
			hosts: Vec::new(),
			remote_ranges: Vec::new(),
			thumbprints: Vec::new(),
		}])
	}

	fn select(&self, url: &Url) -> Option<&SiteEntry> {
		self.entries.iter().find(|e| e.matches_url(url))
	}

	fn check_certificate(entry: &SiteEntry, request: &Request) -> Option<Response> {
		if entry.thumbprints.is_empty() {
			return None;
		}
		match &request.client_cert {
			None => Some(Response::with_status(Status::ClientCertificateRequired)),
			Some(cert) => {
				match entry
					.thumbprints
					.iter()
					.any(|t| cert.matches_thumbprint(t))
				{
					true => None,
					false => Some(Response::with_status(Status::CertificateNotAuthorized)),
				}
			}
		}
	}

	async fn serve_file(path: &Path) -> anyhow::Result<Option<Response>> {
		let metadata = match tokio::fs::metadata(path).await {
			Ok(m) => m,
			Err(_) => return Ok(Some(Response::with_status(Status::NotFound))),
		};
		let file = match tokio::fs::File::open(path).await {
			Ok(f) => f,
			Err(_) => return Ok(Some(Response::with_status(Status::NotFound))),
		};
		let mut response =
			Response::success(mime_for_path(path), Body::Stream(Box::new(file)))
				.attribute("Size", metadata.len().to_string());
		if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
			response = response.attribute("Filename", name);
		}
		if let Ok(modified) = metadata.modified() {
			let stamp = OffsetDateTime::from(modified)
				.format(&Rfc3339)
				.unwrap_or_default();
			response = response.attribute("LastModified", stamp);
		}
		Ok(Some(response))
	}

	async fn list_directory(path: &Path, url: &Url) -> anyhow::Result<Option<Response>> {
		let mut reader = tokio::fs::read_dir(path)
			.await
			.context("directory is unreadable")?;
		let mut directories = Vec::new();
		let mut files = Vec::new();
		while let Some(entry) = reader.next_entry().await.context("directory walk failed")? {
			let Ok(name) = entry.file_name().into_string() else {
				continue;
			};
			let is_dir = entry
				.file_type()
				.await
				.map(|t| t.is_dir())
				.unwrap_or(false);
			match is_dir {
				true => directories.push(name),
				false => files.push(name),
			}
		}
		directories.sort();
		files.sort();

		let mut doc = format!("# Index of {}\n\n", url.path());
		if url.path() != "/" && !url.path().is_empty() {
			doc.push_str("=> ../ ..\n");
		}
		for name in directories {
			let target = percent_encode(name.as_bytes(), LINK_SET);
			doc.push_str(&format!("=> {target}/ {name}/\n"));
		}
		for name in files {
			let target = percent_encode(name.as_bytes(), LINK_SET);
			doc.push_str(&format!("=> {target} {name}\n"));
		}
		Ok(Some(Response::success(
			GEMTEXT_MIME,
			Body::Bytes(doc.into_bytes()),
		)))
	}
}

#[async_trait]
impl Host for StaticFilesHost {
	fn priority(&self) -> u16 {
		self.priority
	}

	fn type_name(&self) -> &'static str {
		std::any::type_name::<StaticFilesHost>()
	}

	fn accept(&self, request: &Request) -> bool {
		match self.select(&request.url) {
			Some(entry) => entry.allows_remote(request),
			None => false,
		}
	}

	async fn respond(&self, request: &mut Request) -> anyhow::Result<Option<Response>> {
		let Some(entry) = self.select(&request.url) else {
			return Ok(None);
		};
		// the certificate ACL answers 60/61 here instead of skipping in
		// accept, so the client learns what went wrong
		if let Some(rejection) = Self::check_certificate(entry, request) {
			return Ok(Some(rejection));
		}
		let path = match entry.map_path(request.url.path()) {
			Ok(path) => path,
			Err(_) => {
				return Ok(Some(Response::failure(
					Status::BadRequest,
					"path escapes the document root",
				)))
			}
		};
		let metadata = match tokio::fs::metadata(&path).await {
			Ok(m) => m,
			Err(_) => return Ok(Some(Response::with_status(Status::NotFound))),
		};
		if metadata.is_dir() {
			if !request.url.path().ends_with('/') {
				let target = format!("{}/", request.url.path());
				return Ok(Some(Response::redirect(Status::PermanentRedirect, target)));
			}
			let index = path.join(INDEX_FILE);
			if tokio::fs::metadata(&index)
				.await
				.map(|m| m.is_file())
				.unwrap_or(false)
			{
				return Self::serve_file(&index).await;
			}
			return match entry.browse {
				true => Self::list_directory(&path, &request.url).await,
				false => Ok(Some(Response::with_status(Status::NotFound))),
			};
		}
		Self::serve_file(&path).await
	}
}
