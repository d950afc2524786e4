//! Key manager interface for drive-side encryption.
//!
//! A key manager resolves a data-key alias (DKi) into the 32-byte data key
//! (DK) handed to the drive. Two backends exist: `simple` takes the key list
//! from mount options, `flatfile` reads it from a file. Both share the
//! DK/DKi list format in [`format`].

pub mod flatfile;
pub mod format;
pub mod simple;

use crate::error::Result;

pub use format::{DK_LENGTH, DKI_LENGTH};

/// A resolved data key with the alias it was selected by.
#[derive(Clone)]
pub struct DataKey {
    pub dk: [u8; DK_LENGTH],
    pub dki: [u8; DKI_LENGTH],
}

impl std::fmt::Debug for DataKey {
    // Never print key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataKey {{ dki: {:?}, dk: <redacted> }}", &self.dki)
    }
}

pub trait KeyManager: Send {
    /// Resolve `alias` to a data key. With no alias, backends configured
    /// with a format-time DKi resolve that; otherwise `Ok(None)` means the
    /// cartridge stays unencrypted.
    fn get_key(&mut self, alias: Option<&[u8; DKI_LENGTH]>) -> Result<Option<DataKey>>;

    /// One-line usage text for the mount tool.
    fn help_message(&self) -> &'static str;
}
