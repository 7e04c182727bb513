use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::forms::FileDecl;

/// Payloads below this size stay in memory; everything else goes to a
/// scratch file.
pub const MEMORY_THRESHOLD: u64 = 10_000;

/// Read block size for disk staging.
const STAGE_BLOCK: usize = 16 * 1024;

/// The per-request scratch directory, created lazily on first use and
/// deleted best-effort when the request is dropped.
#[derive(Debug)]
pub struct ScratchDir {
	root: PathBuf,
	created: bool,
}

impl ScratchDir {
	/// Derives the scratch directory for a request identifier.
	#[must_use]
	pub fn for_request(id: Uuid) -> ScratchDir {
		ScratchDir {
			root: std::env::temp_dir().join(id.to_string()),
			created: false,
		}
	}

	/// Where the directory lives (whether or not it exists yet).
	#[must_use]
	pub fn path(&self) -> &Path {
		&self.root
	}

	/// Creates the directory if this request has not needed it before.
	///
	/// # Errors
	/// Propagates the underlying I/O error.
	pub fn ensure(&mut self) -> Result<&Path> {
		if !self.created {
			std::fs::create_dir_all(&self.root)?;
			self.created = true;
		}
		Ok(&self.root)
	}
}

impl Drop for ScratchDir {
	fn drop(&mut self) {
		if self.created {
			if let Err(e) = std::fs::remove_dir_all(&self.root) {
				debug!(path = %self.root.display(), error = %e, "scratch directory not fully removed");
			}
		}
	}
}

/// Where a staged payload ended up.
enum Payload {
	Pending,
	Memory(Vec<u8>),
	Scratch(PathBuf),
}

/// A file field with (eventually) its payload.
pub struct FileUpload {
	/// The form key that declared the file.
	pub field: String,
	/// File name with path separators, trailing dots/whitespace and
	/// reserved characters removed.
	pub name: String,
	/// File name exactly as the client sent it.
	pub original_name: String,
	/// 1-based payload position.
	pub index: u32,
	/// Payload size in octets.
	pub size: u64,
	payload: Payload,
}

impl FileUpload {
	/// Wraps a declaration, payload not yet read.
	#[must_use]
	pub fn from_decl(decl: FileDecl) -> FileUpload {
		FileUpload {
			name: sanitize_filename(&decl.original_name),
			original_name: decl.original_name,
			field: decl.field,
			index: decl.index,
			size: decl.size,
			payload: Payload::Pending,
		}
	}

	/// Whether the payload has been pulled off the stream yet.
	#[must_use]
	pub fn is_materialized(&self) -> bool {
		!matches!(self.payload, Payload::Pending)
	}

	/// The scratch file backing this payload, when it was staged to disk.
	#[must_use]
	pub fn scratch_path(&self) -> Option<&Path> {
		match &self.payload {
			Payload::Scratch(path) => Some(path),
			_ => None,
		}
	}

	/// The payload octets, reading them back from scratch when staged to
	/// disk.
	///
	/// # Errors
	/// Fails when the payload is still pending or the scratch file is gone.
	pub async fn bytes(&self) -> Result<Vec<u8>> {
		match &self.payload {
			Payload::Pending => Err(ServerError::TruncatedBody {
				expected: self.size,
				got: 0,
			}),
			Payload::Memory(bytes) => Ok(bytes.clone()),
			Payload::Scratch(path) => Ok(tokio::fs::read(path).await?),
		}
	}
}

impl std::fmt::Debug for FileUpload {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("FileUpload")
			.field("field", &self.field)
			.field("name", &self.name)
			.field("index", &self.index)
			.field("size", &self.size)
			.field("materialized", &self.is_materialized())
			.finish()
	}
}

/// Strips directories, trims trailing dots and whitespace, and replaces
/// characters that are unsafe in a file name with `_`.
#[must_use]
pub fn sanitize_filename(raw: &str) -> String {
	let base = raw
		.rsplit(['/', '\\'])
		.next()
		.unwrap_or_default();
	let cleaned: String = base
		.chars()
		.map(|c| match c {
			c if (c as u32) < 0x20 => '_',
			'<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
			c => c,
		})
		.collect();
	let trimmed = cleaned.trim_end_matches(['.', ' ', '\t']);
	match trimmed.is_empty() {
		true => "unnamed".to_string(),
		false => trimmed.to_string(),
	}
}

/// Pulls every pending payload off the stream, in ascending index order.
///
/// Small payloads are buffered; large ones stream into a fresh scratch file
/// named by a new identifier. Each read is bounded by `read_timeout`.
///
/// # Errors
/// `TruncatedBody` when the stream ends short; I/O errors from staging.
pub async fn materialize<R>(
	stream: &mut R,
	files: &mut [FileUpload],
	scratch: &mut ScratchDir,
	read_timeout: Duration,
) -> Result<()>
where
	R: AsyncRead + Unpin,
{
	for file in files.iter_mut() {
		if file.is_materialized() {
			continue;
		}
		file.payload = stage_one(stream, file.size, scratch, read_timeout).await?;
	}
	Ok(())
}

async fn stage_one<R>(
	stream: &mut R,
	size: u64,
	scratch: &mut ScratchDir,
	read_timeout: Duration,
) -> Result<Payload>
where
	R: AsyncRead + Unpin,
{
	if size < MEMORY_THRESHOLD {
		let bytes = read_exact_octets(stream, size, read_timeout).await?;
		return Ok(Payload::Memory(bytes));
	}
	let dir = scratch.ensure()?.to_path_buf();
	let path = dir.join(Uuid::new_v4().to_string());
	let mut out = tokio::fs::File::create(&path).await?;
	let mut remaining = size;
	let mut block = vec![0u8; STAGE_BLOCK];
	while remaining > 0 {
		let want = usize::try_from(remaining.min(STAGE_BLOCK as u64)).unwrap_or(STAGE_BLOCK);
		let read = timed_read(stream, &mut block[..want], read_timeout).await?;
		if read == 0 {
			return Err(ServerError::TruncatedBody {
				expected: size,
				got: size - remaining,
			});
		}
		out.write_all(&block[..read]).await?;
		remaining -= read as u64;
	}
	out.flush().await?;
	Ok(Payload::Scratch(path))
}

/// Reads exactly `size` octets into memory.
///
/// # Errors
/// `TruncatedBody` when the stream ends short.
pub async fn read_exact_octets<R>(
	stream: &mut R,
	size: u64,
	read_timeout: Duration,
) -> Result<Vec<u8>>
where
	R: AsyncRead + Unpin,
{
	let capacity = usize::try_from(size)
		.map_err(|_| ServerError::MalformedForm(format!("payload size {size} is unusable")))?;
	let mut bytes = vec![0u8; capacity];
	let mut filled = 0;
	while filled < capacity {
		let read = timed_read(stream, &mut bytes[filled..], read_timeout).await?;
		if read == 0 {
			return Err(ServerError::TruncatedBody {
				expected: size,
				got: filled as u64,
			});
		}
		filled += read;
	}
	Ok(bytes)
}

async fn timed_read<R>(stream: &mut R, buf: &mut [u8], limit: Duration) -> Result<usize>
where
	R: AsyncRead + Unpin,
{
	let read = timeout(limit, stream.read(buf))
		.await
		.map_err(|_| {
			ServerError::Filesystem(std::io::Error::new(
				std::io::ErrorKind::TimedOut,
				"read timed out",
			))
		})??;
	Ok(read)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::forms::Form;

	const LIMIT: Duration = Duration::from_secs(5);

	fn uploads_from(query: &str) -> Vec<FileUpload> {
		Form::decode(query)
			.declared_files()
			.unwrap()
			.into_iter()
			.map(FileUpload::from_decl)
			.collect()
	}

	#[test]
	fn filenames_are_sanitized() {
		assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
		assert_eq!(sanitize_filename("c:\\temp\\notes.txt"), "notes.txt");
		assert_eq!(sanitize_filename("report. . ."), "report");
		assert_eq!(sanitize_filename("a<b>c.txt"), "a_b_c.txt");
		assert_eq!(sanitize_filename("..."), "unnamed");
		assert_eq!(sanitize_filename("plain.gmi"), "plain.gmi");
	}

	#[tokio::test]
	async fn concatenated_payloads_split_by_declared_sizes() {
		let mut files = uploads_from(
			"a=a.bin&a.index=1&a.size=5&b=b.bin&b.index=2&b.size=7&c=c.bin&c.index=3&c.size=9",
		);
		let body = b"aaaaabbbbbbbccccccccc";
		assert_eq!(body.len(), 21);
		let mut stream: &[u8] = body;
		let mut scratch = ScratchDir::for_request(Uuid::new_v4());
		materialize(&mut stream, &mut files, &mut scratch, LIMIT)
			.await
			.unwrap();
		assert_eq!(files[0].bytes().await.unwrap(), b"aaaaa");
		assert_eq!(files[1].bytes().await.unwrap(), b"bbbbbbb");
		assert_eq!(files[2].bytes().await.unwrap(), b"ccccccccc");
		assert!(stream.is_empty());
	}

	#[tokio::test]
	async fn short_stream_reports_truncation() {
		let mut files = uploads_from("a=a.bin&a.index=1&a.size=10");
		let mut stream: &[u8] = b"only4";
		let mut scratch = ScratchDir::for_request(Uuid::new_v4());
		let err = materialize(&mut stream, &mut files, &mut scratch, LIMIT)
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			ServerError::TruncatedBody {
				expected: 10,
				got: 5
			}
		));
	}

	#[tokio::test]
	async fn large_payloads_go_to_scratch() {
		let size = MEMORY_THRESHOLD + 123;
		let payload = vec![0xAB; usize::try_from(size).unwrap()];
		let mut files =
			uploads_from(&format!("big=big.bin&big.index=1&big.size={size}"));
		let mut stream: &[u8] = &payload;
		let mut scratch = ScratchDir::for_request(Uuid::new_v4());
		materialize(&mut stream, &mut files, &mut scratch, LIMIT)
			.await
			.unwrap();
		let path = files[0].scratch_path().unwrap().to_path_buf();
		assert!(path.starts_with(scratch.path()));
		assert_eq!(files[0].bytes().await.unwrap(), payload);
		drop(files);
		drop(scratch);
		assert!(!path.exists(), "scratch dir should be removed on drop");
	}

	#[tokio::test]
	async fn small_payloads_never_touch_disk() {
		let mut files = uploads_from("s=s.bin&s.index=1&s.size=4");
		let mut stream: &[u8] = b"1234";
		let mut scratch = ScratchDir::for_request(Uuid::new_v4());
		materialize(&mut stream, &mut files, &mut scratch, LIMIT)
			.await
			.unwrap();
		assert!(files[0].scratch_path().is_none());
		assert!(!scratch.path().exists());
	}
}
