//! The DK/DKi pair list format shared by the KMI backends.
//!
//! A list is `DK:DKi[/DK:DKi...]` where each DK is 32 raw bytes in base64
//! (44 characters including padding) and each DKi is 3 printable ASCII
//! characters followed by 18 hex nibbles (21 characters, decoding to 12
//! bytes). The parsed list lives only as long as one key lookup: after every
//! `get_key` the material is zeroed and dropped.

use crate::error::{LtfsError, Result};
use crate::kmi::DataKey;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, error};

pub const DK_LENGTH: usize = 32;
pub const DKI_LENGTH: usize = 12;
pub const DKI_ASCII_LENGTH: usize = 3;

/// Base64 text length of one DK, padding included.
pub const DK_TEXT_LEN: usize = (DK_LENGTH * 8 + 5) / 6 / 4 * 4 + 4; // 44
/// Text length of one DKi: ASCII prefix plus hex body.
pub const DKI_TEXT_LEN: usize = DKI_ASCII_LENGTH + (DKI_LENGTH - DKI_ASCII_LENGTH) * 2; // 21

/// Lifecycle of the parsed key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Set,
    Cleared,
    Destroyed,
}

/// Holds the parsed key list between `set` and `clear`. The state machine
/// refuses out-of-order use; a list can only be installed from the
/// initialized or cleared states.
pub struct KeyStore {
    state: State,
    keys: Vec<DataKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        KeyStore {
            state: State::Initialized,
            keys: Vec::new(),
        }
    }

    fn set_dk_list(&mut self, dk_list: &str) -> Result<()> {
        if self.state != State::Initialized && self.state != State::Cleared {
            error!("key list installed in state {:?}", self.state);
            return Err(LtfsError::InvalidSequence);
        }
        self.keys = parse_dk_list(dk_list)?;
        self.state = State::Set;
        Ok(())
    }

    fn clear(&mut self) {
        for key in self.keys.iter_mut() {
            key.dk.fill(0);
            key.dki.fill(0);
        }
        self.keys.clear();
        if self.state == State::Set {
            self.state = State::Cleared;
        }
    }

    /// Parse the list, look up the alias, and clear the material again.
    ///
    /// With no alias and no format-time DKi this is the unencrypted path and
    /// resolves to `None`.
    pub fn get_key(
        &mut self,
        dk_list: &str,
        alias: Option<&[u8; DKI_LENGTH]>,
        dki_for_format: Option<&str>,
    ) -> Result<Option<DataKey>> {
        self.set_dk_list(dk_list)?;
        let result = self.lookup(alias, dki_for_format);
        self.clear();
        result
    }

    fn lookup(
        &self,
        alias: Option<&[u8; DKI_LENGTH]>,
        dki_for_format: Option<&str>,
    ) -> Result<Option<DataKey>> {
        let wanted: [u8; DKI_LENGTH] = match alias {
            Some(a) => *a,
            None => match dki_for_format {
                Some(text) => parse_dki(text)?,
                None => return Ok(None),
            },
        };
        for key in &self.keys {
            if key.dki == wanted {
                debug!("data key resolved by alias");
                return Ok(Some(key.clone()));
            }
        }
        error!("no data key matches the requested alias");
        Err(LtfsError::KeyNotFound)
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        self.clear();
        self.state = State::Destroyed;
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        KeyStore::new()
    }
}

fn check_dk_text(text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    if bytes.len() != DK_TEXT_LEN {
        return Err(LtfsError::bad_arg("DK length"));
    }
    let body = (DK_LENGTH * 8 + 5) / 6;
    for &b in &bytes[..body] {
        if !(b.is_ascii_alphanumeric() || b == b'+' || b == b'/') {
            return Err(LtfsError::bad_arg("DK"));
        }
    }
    for &b in &bytes[body..] {
        if b != b'=' {
            return Err(LtfsError::bad_arg("DK padding"));
        }
    }
    Ok(())
}

fn check_dki_text(text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    if bytes.len() != DKI_TEXT_LEN {
        return Err(LtfsError::bad_arg("DKi length"));
    }
    for &b in &bytes[..DKI_ASCII_LENGTH] {
        if !b.is_ascii_graphic() && b != b' ' {
            return Err(LtfsError::bad_arg("DKi ascii"));
        }
    }
    for &b in &bytes[DKI_ASCII_LENGTH..] {
        if !b.is_ascii_hexdigit() {
            return Err(LtfsError::bad_arg("DKi binary"));
        }
    }
    Ok(())
}

fn decode_dk(text: &str) -> Result<[u8; DK_LENGTH]> {
    check_dk_text(text)?;
    let decoded = BASE64
        .decode(text)
        .map_err(|e| LtfsError::bad_arg(format!("DK base64: {}", e)))?;
    if decoded.len() != DK_LENGTH {
        return Err(LtfsError::bad_arg("DK decoded length"));
    }
    let mut dk = [0u8; DK_LENGTH];
    dk.copy_from_slice(&decoded);
    Ok(dk)
}

/// Decode a DKi from its ASCII-and-hex text form to the 12 binary bytes.
pub fn parse_dki(text: &str) -> Result<[u8; DKI_LENGTH]> {
    check_dki_text(text)?;
    let mut dki = [0u8; DKI_LENGTH];
    dki[..DKI_ASCII_LENGTH].copy_from_slice(&text.as_bytes()[..DKI_ASCII_LENGTH]);
    let hex_body = hex::decode(&text[DKI_ASCII_LENGTH..])
        .map_err(|e| LtfsError::bad_arg(format!("DKi hex: {}", e)))?;
    dki[DKI_ASCII_LENGTH..].copy_from_slice(&hex_body);
    Ok(dki)
}

/// Render a DKi back to its text form.
pub fn format_dki(dki: &[u8; DKI_LENGTH]) -> String {
    let ascii = String::from_utf8_lossy(&dki[..DKI_ASCII_LENGTH]).into_owned();
    format!(
        "{}{}",
        ascii,
        hex::encode_upper(&dki[DKI_ASCII_LENGTH..])
    )
}

/// Parse a full `DK:DKi[/DK:DKi...]` list.
pub fn parse_dk_list(dk_list: &str) -> Result<Vec<DataKey>> {
    let trimmed = dk_list.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut keys = Vec::new();
    for pair in trimmed.split('/') {
        let (dk_text, dki_text) = pair
            .split_once(':')
            .ok_or_else(|| LtfsError::bad_arg("DK/DKi separator"))?;
        keys.push(DataKey {
            dk: decode_dk(dk_text)?,
            dki: parse_dki(dki_text)?,
        });
    }
    Ok(keys)
}

/// Render a key list back to its text form; inverse of [`parse_dk_list`].
pub fn format_dk_list(keys: &[DataKey]) -> String {
    keys.iter()
        .map(|k| format!("{}:{}", BASE64.encode(k.dk), format_dki(&k.dki)))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_list() -> String {
        let dk1 = BASE64.encode([0x11u8; DK_LENGTH]);
        let dk2 = BASE64.encode([0x22u8; DK_LENGTH]);
        format!("{}:ABC000102030405060708/{}:XYZ0A0B0C0D0E0F101112", dk1, dk2)
    }

    #[test]
    fn text_lengths_match_the_wire_format() {
        assert_eq!(DK_TEXT_LEN, 44);
        assert_eq!(DKI_TEXT_LEN, 21);
        assert_eq!(BASE64.encode([0u8; DK_LENGTH]).len(), DK_TEXT_LEN);
    }

    #[test]
    fn parse_format_round_trip() {
        let list = sample_list();
        let keys = parse_dk_list(&list).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].dk, [0x11u8; DK_LENGTH]);
        assert_eq!(&keys[0].dki[..3], b"ABC");
        assert_eq!(format_dk_list(&keys), list);
    }

    #[test]
    fn lookup_by_alias() {
        let mut store = KeyStore::new();
        let alias = parse_dki("XYZ0A0B0C0D0E0F101112").unwrap();
        let key = store
            .get_key(&sample_list(), Some(&alias), None)
            .unwrap()
            .unwrap();
        assert_eq!(key.dk, [0x22u8; DK_LENGTH]);
    }

    #[test]
    fn missing_alias_is_key_not_found() {
        let mut store = KeyStore::new();
        let alias = parse_dki("NOP000000000000000000").unwrap();
        assert!(matches!(
            store.get_key(&sample_list(), Some(&alias), None),
            Err(LtfsError::KeyNotFound)
        ));
    }

    #[test]
    fn no_alias_no_format_dki_is_unencrypted() {
        let mut store = KeyStore::new();
        assert!(store
            .get_key(&sample_list(), None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn format_dki_selects_default_key() {
        let mut store = KeyStore::new();
        let key = store
            .get_key(&sample_list(), None, Some("ABC000102030405060708"))
            .unwrap()
            .unwrap();
        assert_eq!(key.dk, [0x11u8; DK_LENGTH]);
    }

    #[test]
    fn list_is_cleared_between_lookups() {
        let mut store = KeyStore::new();
        let alias = parse_dki("ABC000102030405060708").unwrap();
        store
            .get_key(&sample_list(), Some(&alias), None)
            .unwrap()
            .unwrap();
        assert!(store.keys.is_empty());
        // The second lookup reinstalls from the cleared state.
        store
            .get_key(&sample_list(), Some(&alias), None)
            .unwrap()
            .unwrap();
    }

    #[test]
    fn malformed_lists_rejected() {
        assert!(parse_dk_list("short:ABC000102030405060708").is_err());
        let dk = BASE64.encode([0u8; DK_LENGTH]);
        // Bad separator.
        assert!(parse_dk_list(&format!("{};ABC000102030405060708", dk)).is_err());
        // DKi hex body too short.
        assert!(parse_dk_list(&format!("{}:ABC00", dk)).is_err());
        // Non-hex nibble.
        assert!(parse_dk_list(&format!("{}:ABC0001020304050607ZZ", dk)).is_err());
    }
}
