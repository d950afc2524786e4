//! `simple` key manager backend: the DK/DKi list arrives in the mount
//! options and never touches disk.

use crate::error::{LtfsError, Result};
use crate::kmi::format::KeyStore;
use crate::kmi::{DataKey, KeyManager, DKI_LENGTH};

pub struct SimpleKmi {
    dk_list: String,
    dki_for_format: Option<String>,
    store: KeyStore,
}

impl SimpleKmi {
    pub fn new(dk_list: String, dki_for_format: Option<String>) -> Self {
        SimpleKmi {
            dk_list,
            dki_for_format,
            store: KeyStore::new(),
        }
    }

    /// Parse `kmi_dk_list=...` / `kmi_dki_for_format=...` option strings.
    pub fn parse_opts(opts: &[String]) -> Result<Self> {
        let mut dk_list = None;
        let mut dki_for_format = None;
        for opt in opts {
            if let Some(v) = opt.strip_prefix("kmi_dk_list=") {
                dk_list = Some(v.to_string());
            } else if let Some(v) = opt.strip_prefix("kmi_dki_for_format=") {
                dki_for_format = Some(v.to_string());
            }
        }
        match dk_list {
            Some(list) => Ok(SimpleKmi::new(list, dki_for_format)),
            None => Err(LtfsError::NullArg("kmi_dk_list")),
        }
    }
}

impl KeyManager for SimpleKmi {
    fn get_key(&mut self, alias: Option<&[u8; DKI_LENGTH]>) -> Result<Option<DataKey>> {
        self.store
            .get_key(&self.dk_list, alias, self.dki_for_format.as_deref())
    }

    fn help_message(&self) -> &'static str {
        "-o kmi_dk_list=<DK:DKi[/DK:DKi...]> [-o kmi_dki_for_format=<DKi>]"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    #[test]
    fn parse_opts_requires_dk_list() {
        assert!(SimpleKmi::parse_opts(&["foo=bar".to_string()]).is_err());
        let dk = BASE64.encode([3u8; 32]);
        let kmi = SimpleKmi::parse_opts(&[
            format!("kmi_dk_list={}:ABC000102030405060708", dk),
            "kmi_dki_for_format=ABC000102030405060708".to_string(),
        ])
        .unwrap();
        assert!(kmi.dki_for_format.is_some());
    }

    #[test]
    fn resolves_default_key_for_format() {
        let dk = BASE64.encode([3u8; 32]);
        let mut kmi = SimpleKmi::new(
            format!("{}:ABC000102030405060708", dk),
            Some("ABC000102030405060708".to_string()),
        );
        let key = kmi.get_key(None).unwrap().unwrap();
        assert_eq!(key.dk, [3u8; 32]);
    }
}
