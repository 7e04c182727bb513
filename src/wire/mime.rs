use std::path::Path;

/// MIME type served when the extension table has no opinion.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Full meta served for gemtext documents.
pub const GEMTEXT_MIME: &str = "text/gemini; charset=utf-8";

/// MIME type of the dialect capability document.
pub const INFO_MIME: &str = "text/gemini+info";

/// Looks up the MIME type for a file by extension.
///
/// `.gmi` is the native document type and is special-cased; everything else
/// goes through the extension table.
#[must_use]
pub fn mime_for_path(path: &Path) -> String {
	match path.extension().and_then(|e| e.to_str()) {
		Some(ext) if ext.eq_ignore_ascii_case("gmi") => GEMTEXT_MIME.to_string(),
		_ => mime_guess::from_path(path)
			.first()
			.map_or_else(|| DEFAULT_MIME.to_string(), |m| m.essence_str().to_string()),
	}
}
