use percent_encoding::{percent_encode, AsciiSet, CONTROLS};

/// Characters that must never appear raw in an extended meta key.
///
/// Keys are always percent-encoded so a key can never smuggle a separator;
/// values get quoting instead and only escape what would be ambiguous.
const KEY_SET: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b';')
	.add(b'=')
	.add(b'%');

const VALUE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'"');

/// Serializes extended meta attributes onto a MIME meta:
/// `type; k1=v1; k2=v2; …`.
#[must_use]
pub fn format_extended(mime: &str, attributes: &[(String, String)]) -> String {
	let mut out = String::from(mime);
	for (key, value) in attributes {
		out.push_str("; ");
		out.push_str(&escape_key(key));
		out.push('=');
		out.push_str(&escape_value(value));
	}
	out
}

/// Percent-encodes an attribute key.
#[must_use]
pub fn escape_key(key: &str) -> String {
	percent_encode(key.as_bytes(), KEY_SET).to_string()
}

/// Escapes an attribute value: control characters are percent-encoded, and
/// values containing whitespace or `;` are wrapped in double quotes. The
/// empty value serializes as `""`.
#[must_use]
pub fn escape_value(value: &str) -> String {
	if value.is_empty() {
		return "\"\"".to_string();
	}
	let escaped = match value.bytes().any(|b| b < 0x20) {
		true => percent_encode(value.as_bytes(), VALUE_SET).to_string(),
		false => value.to_string(),
	};
	match escaped.contains([' ', '\t', ';']) {
		true => format!("\"{escaped}\""),
		false => escaped,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
		pairs
			.iter()
			.map(|(k, v)| ((*k).to_string(), (*v).to_string()))
			.collect()
	}

	#[test]
	fn plain_attributes_join_with_semicolons() {
		let meta = format_extended(
			"text/plain",
			&attrs(&[("Size", "123"), ("Filename", "notes.txt")]),
		);
		assert_eq!(meta, "text/plain; Size=123; Filename=notes.txt");
	}

	#[test]
	fn keys_are_percent_encoded() {
		assert_eq!(escape_key("a key;="), "a%20key%3B%3D");
	}

	#[test]
	fn values_with_whitespace_or_semicolons_are_quoted() {
		assert_eq!(escape_value("two words"), "\"two words\"");
		assert_eq!(escape_value("a;b"), "\"a;b\"");
		assert_eq!(escape_value("plain"), "plain");
	}

	#[test]
	fn values_with_control_characters_are_percent_encoded() {
		assert_eq!(escape_value("a\nb"), "a%0Ab");
	}

	#[test]
	fn empty_values_serialize_as_empty_quotes() {
		assert_eq!(escape_value(""), "\"\"");
	}
}
