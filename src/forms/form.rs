use percent_encoding::percent_decode_str;

use crate::error::{Result, ServerError};

/// Suffix marking a file field's sequence number.
const INDEX_SUFFIX: &str = ".index";

/// Suffix marking a file field's payload size.
const SIZE_SUFFIX: &str = ".size";

/// A decoded URL-encoded form.
///
/// Keys compare case-insensitively and values keep their insertion order.
/// Two suffix keys are reserved per file field: `<k>.index` and `<k>.size`;
/// a key is a file field exactly when both parse.
#[derive(Debug, Default, Clone)]
pub struct Form {
	entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
	key: String,
	values: Vec<String>,
}

/// A file field as declared by the form, before any payload is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDecl {
	/// The form key declaring the file.
	pub field: String,
	/// The client's file name, as transmitted.
	pub original_name: String,
	/// 1-based position of the payload in the request body (0 in body mode).
	pub index: u32,
	/// Payload size in octets.
	pub size: u64,
}

impl Form {
	/// The empty form.
	#[must_use]
	pub fn empty() -> Form {
		Form::default()
	}

	/// Decodes a query string: pieces split on `&`, keys from values on the
	/// first `=`, both sides percent-decoded. A piece without `=` becomes a
	/// bare key with one empty value; repeated keys accumulate.
	#[must_use]
	pub fn decode(query: &str) -> Form {
		let mut form = Form::empty();
		for piece in query.split('&') {
			if piece.is_empty() {
				continue;
			}
			let (key, value) = match piece.split_once('=') {
				Some((k, v)) => (decode_piece(k), decode_piece(v)),
				None => (decode_piece(piece), String::new()),
			};
			form.append(key, value);
		}
		form
	}

	/// Appends a value under a key, accumulating on repeats.
	pub fn append(&mut self, key: String, value: String) {
		match self
			.entries
			.iter_mut()
			.find(|e| e.key.eq_ignore_ascii_case(&key))
		{
			Some(entry) => entry.values.push(value),
			None => self.entries.push(Entry {
				key,
				values: vec![value],
			}),
		}
	}

	/// All values stored under a key.
	#[must_use]
	pub fn get(&self, key: &str) -> Option<&[String]> {
		self.entries
			.iter()
			.find(|e| e.key.eq_ignore_ascii_case(key))
			.map(|e| e.values.as_slice())
	}

	/// The first value stored under a key.
	#[must_use]
	pub fn first(&self, key: &str) -> Option<&str> {
		self.get(key).and_then(|v| v.first()).map(String::as_str)
	}

	/// Whether a key is a file field: both reserved suffix keys exist and
	/// parse as index and size.
	#[must_use]
	pub fn is_file(&self, key: &str) -> bool {
		self.file_decl(key).is_some()
	}

	fn file_decl(&self, key: &str) -> Option<FileDecl> {
		let index: u32 = self
			.first(&format!("{key}{INDEX_SUFFIX}"))?
			.parse()
			.ok()?;
		let size: u64 = self.first(&format!("{key}{SIZE_SUFFIX}"))?.parse().ok()?;
		Some(FileDecl {
			field: key.to_string(),
			original_name: self.first(key).unwrap_or_default().to_string(),
			index,
			size,
		})
	}

	/// The public keys: every key except the reserved suffixes of file
	/// fields.
	#[must_use]
	pub fn keys(&self) -> Vec<&str> {
		self.entries
			.iter()
			.filter(|e| !self.is_reserved_suffix(&e.key))
			.map(|e| e.key.as_str())
			.collect()
	}

	fn is_reserved_suffix(&self, key: &str) -> bool {
		for suffix in [INDEX_SUFFIX, SIZE_SUFFIX] {
			if let Some(base) = strip_suffix_ignore_case(key, suffix) {
				if self.is_file(base) {
					return true;
				}
			}
		}
		false
	}

	/// Detects body mode: exactly one public key, which is a file field
	/// with index 0.
	#[must_use]
	pub fn body_mode(&self) -> Option<FileDecl> {
		let keys = self.keys();
		let [only] = keys.as_slice() else {
			return None;
		};
		match self.file_decl(only) {
			Some(decl) if decl.index == 0 => Some(decl),
			_ => None,
		}
	}

	/// Collects the declared file fields in ascending index order and
	/// validates that their indices form exactly the sequence `1..N`.
	///
	/// # Errors
	/// `MalformedForm` on a gap, a duplicate, or an index 0 outside body
	/// mode.
	pub fn declared_files(&self) -> Result<Vec<FileDecl>> {
		let mut files: Vec<FileDecl> = self
			.entries
			.iter()
			.filter(|e| !self.is_reserved_suffix(&e.key))
			.filter_map(|e| self.file_decl(&e.key))
			.collect();
		files.sort_by_key(|f| f.index);
		for (position, file) in files.iter().enumerate() {
			let expected =
				u32::try_from(position + 1).map_err(|_| {
					ServerError::MalformedForm("too many file fields".to_string())
				})?;
			if file.index != expected {
				return Err(ServerError::MalformedForm(format!(
					"file indices must form 1..{}, found index {} at position {}",
					files.len(),
					file.index,
					position + 1
				)));
			}
		}
		Ok(files)
	}

	/// Whether the form has no entries at all.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

fn decode_piece(raw: &str) -> String {
	percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn strip_suffix_ignore_case<'a>(key: &'a str, suffix: &str) -> Option<&'a str> {
	if key.len() < suffix.len() || !key.is_char_boundary(key.len() - suffix.len()) {
		return None;
	}
	let (base, tail) = key.split_at(key.len() - suffix.len());
	match tail.eq_ignore_ascii_case(suffix) {
		true => Some(base),
		false => None,
	}
}
