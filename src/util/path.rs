//! Path normalization and platform-safe names.
//!
//! Names inside the volume are UTF-8 in NFC; comparison always happens on the
//! NFC form. The platform-safe variant percent-encodes characters the host OS
//! cannot represent in a file name, and is what keys a directory's child
//! table (and what the dcache mirrors to disk).

use crate::error::{LtfsError, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use unicode_normalization::UnicodeNormalization;

/// Longest permitted name component, in bytes of the NFC form.
pub const MAX_NAME_BYTES: usize = 255;

/// Characters a host filesystem may refuse: the Windows reserved set plus
/// the percent sign itself so decoding stays unambiguous.
const UNSAFE: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b':')
    .add(b'"')
    .add(b'\\')
    .add(b'|')
    .add(b'?')
    .add(b'*');

/// Normalize a volume path: forward slashes, collapsed separators, no
/// trailing slash (except root), NFC composition.
pub fn normalize(path: &str) -> String {
    let mut normalized: String = path.replace('\\', "/").nfc().collect();

    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }

    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    normalized
}

/// Normalize a single name component to NFC.
pub fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

/// Percent-encode a name so any host OS can store it.
pub fn platform_safe_name(name: &str) -> String {
    utf8_percent_encode(name, UNSAFE).to_string()
}

/// Reverse of [`platform_safe_name`]; invalid escapes pass through verbatim.
pub fn decode_platform_safe_name(name: &str) -> String {
    percent_decode_str(name)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

/// Split an absolute volume path into validated NFC components.
pub fn split(path: &str) -> Result<Vec<String>> {
    let normalized = normalize(path);
    if !normalized.starts_with('/') {
        return Err(LtfsError::invalid_path(path));
    }

    let mut components = Vec::new();
    for part in normalized.split('/').filter(|p| !p.is_empty()) {
        validate_name(part)?;
        components.push(part.to_string());
    }
    Ok(components)
}

/// Reject empty names, dot entries, embedded separators/NULs and over-long
/// components.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(LtfsError::invalid_path(name));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(LtfsError::invalid_path(name));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(LtfsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize("//a//b//"), "/a/b");
        assert_eq!(normalize("\\a\\b"), "/a/b");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn nfc_composition() {
        // "e" followed by combining acute composes to a single code point.
        let decomposed = "cafe\u{0301}";
        assert_eq!(normalize_name(decomposed), "caf\u{00e9}");
    }

    #[test]
    fn platform_safe_round_trip() {
        let name = "a:b*c?d";
        let safe = platform_safe_name(name);
        assert!(!safe.contains(':'));
        assert!(!safe.contains('*'));
        assert_eq!(decode_platform_safe_name(&safe), name);
    }

    #[test]
    fn split_rejects_relative_and_dots() {
        assert!(split("a/b").is_err());
        assert!(split("/a/../b").is_err());
        assert_eq!(split("/a/b").unwrap(), vec!["a", "b"]);
        assert!(split("/").unwrap().is_empty());
    }

    #[test]
    fn long_name_rejected() {
        let long = "x".repeat(MAX_NAME_BYTES + 1);
        assert!(matches!(
            validate_name(&long),
            Err(LtfsError::NameTooLong(_))
        ));
    }
}
