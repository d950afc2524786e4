//! `flatfile` key manager backend: the DK/DKi list is kept in a file so the
//! key material stays out of process command lines.

use crate::error::{LtfsError, Result};
use crate::kmi::format::KeyStore;
use crate::kmi::{DataKey, KeyManager, DKI_LENGTH};
use std::path::PathBuf;
use tracing::debug;

pub struct FlatfileKmi {
    keyfile: PathBuf,
    dki_for_format: Option<String>,
    store: KeyStore,
}

impl FlatfileKmi {
    pub fn new(keyfile: PathBuf, dki_for_format: Option<String>) -> Self {
        FlatfileKmi {
            keyfile,
            dki_for_format,
            store: KeyStore::new(),
        }
    }

    /// Parse `kmi_key_file=...` / `kmi_dki_for_format=...` option strings.
    pub fn parse_opts(opts: &[String]) -> Result<Self> {
        let mut keyfile = None;
        let mut dki_for_format = None;
        for opt in opts {
            if let Some(v) = opt.strip_prefix("kmi_key_file=") {
                keyfile = Some(PathBuf::from(v));
            } else if let Some(v) = opt.strip_prefix("kmi_dki_for_format=") {
                dki_for_format = Some(v.to_string());
            }
        }
        match keyfile {
            Some(path) => Ok(FlatfileKmi::new(path, dki_for_format)),
            None => Err(LtfsError::NullArg("kmi_key_file")),
        }
    }
}

impl KeyManager for FlatfileKmi {
    fn get_key(&mut self, alias: Option<&[u8; DKI_LENGTH]>) -> Result<Option<DataKey>> {
        // Read the file per lookup: operators rotate key files under a
        // mounted volume.
        let content = std::fs::read_to_string(&self.keyfile).map_err(LtfsError::Io)?;
        let dk_list = content.trim();
        debug!("loaded key list from {}", self.keyfile.display());
        self.store
            .get_key(dk_list, alias, self.dki_for_format.as_deref())
    }

    fn help_message(&self) -> &'static str {
        "-o kmi_key_file=<path> [-o kmi_dki_for_format=<DKi>]"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmi::format::parse_dki;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::io::Write;

    #[test]
    fn reads_keys_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys");
        let dk = BASE64.encode([9u8; 32]);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}:KEY000102030405060708", dk).unwrap();

        let mut kmi = FlatfileKmi::new(path, None);
        let alias = parse_dki("KEY000102030405060708").unwrap();
        let key = kmi.get_key(Some(&alias)).unwrap().unwrap();
        assert_eq!(key.dk, [9u8; 32]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let mut kmi = FlatfileKmi::new(PathBuf::from("/nonexistent/keys"), None);
        let alias = parse_dki("KEY000102030405060708").unwrap();
        assert!(matches!(
            kmi.get_key(Some(&alias)),
            Err(LtfsError::Io(_))
        ));
    }
}
