use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use url::Url;

use crate::error::ServerError;
use crate::wire::effective_port;

/// A pattern matched against a request's `host[:port]`.
///
/// `*` and `*:*` accept anything, `*:PORT` any host on one port, and a
/// concrete host may carry a port or leave it wildcarded. Normalization
/// lower-cases DNS names and brackets bare IPv6 literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
	host: String,
	port: Option<u16>,
}

impl HostSpec {
	/// The accept-everything pattern.
	#[must_use]
	pub fn any() -> HostSpec {
		HostSpec {
			host: "*".to_string(),
			port: None,
		}
	}

	/// The pattern's host part, normalized (`*` for the wildcard).
	#[must_use]
	pub fn host(&self) -> &str {
		&self.host
	}

	/// The pattern's port, `None` meaning any.
	#[must_use]
	pub fn port(&self) -> Option<u16> {
		self.port
	}

	/// Matches a normalized-or-raw host name and a concrete port.
	#[must_use]
	pub fn matches(&self, host: &str, port: u16) -> bool {
		if let Some(want) = self.port {
			if want != port {
				return false;
			}
		}
		self.host == "*" || normalize_host(host) == self.host
	}

	/// Matches a request URL, applying the protocol's default port.
	#[must_use]
	pub fn matches_url(&self, url: &Url) -> bool {
		match url.host_str() {
			Some(host) => self.matches(host, effective_port(url)),
			None => false,
		}
	}
}

fn normalize_host(host: &str) -> String {
	let lower = host.to_ascii_lowercase();
	// bare IPv6 literals get brackets so they compare like URL hosts
	match lower.contains(':') && !lower.starts_with('[') {
		true => format!("[{lower}]"),
		false => lower,
	}
}

impl FromStr for HostSpec {
	type Err = ServerError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ServerError::Config("empty host spec".to_string()));
		}
		let (raw_host, raw_port) = split_spec(s)?;
		let host = match raw_host == "*" {
			true => "*".to_string(),
			false => normalize_host(raw_host),
		};
		let port = match raw_port {
			None | Some("*") => None,
			Some(p) => Some(p.parse::<u16>().map_err(|_| {
				ServerError::Config(format!("bad port in host spec {s:?}"))
			})?),
		};
		Ok(HostSpec { host, port })
	}
}

fn split_spec(s: &str) -> Result<(&str, Option<&str>), ServerError> {
	if let Some(rest) = s.strip_prefix('[') {
		// bracketed IPv6, optionally followed by :port
		let end = rest
			.find(']')
			.ok_or_else(|| ServerError::Config(format!("unterminated bracket in {s:?}")))?;
		let host = &s[..end + 2];
		let tail = &rest[end + 1..];
		return match tail.strip_prefix(':') {
			Some(port) => Ok((host, Some(port))),
			None if tail.is_empty() => Ok((host, None)),
			None => Err(ServerError::Config(format!("trailing junk in {s:?}"))),
		};
	}
	if s.matches(':').count() > 1 {
		// a bare IPv6 literal with no brackets and no port
		return match s.parse::<Ipv6Addr>() {
			Ok(_) => Ok((s, None)),
			Err(_) => Err(ServerError::Config(format!(
				"host spec {s:?} is not an address or host:port"
			))),
		};
	}
	match s.split_once(':') {
		Some((host, port)) => Ok((host, Some(port))),
		None => Ok((s, None)),
	}
}

impl fmt::Display for HostSpec {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self.port {
			Some(port) => write!(f, "{}:{}", self.host, port),
			None => write!(f, "{}:*", self.host),
		}
	}
}
