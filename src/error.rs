use thiserror::Error;

use crate::scsi::sense::DeviceError;

pub type Result<T> = std::result::Result<T, LtfsError>;

/// Error type shared by every layer of the library.
///
/// Low-level SCSI failures are translated exactly once (sense data into a
/// [`DeviceError`]) and carried here unwrapped; the adapter sitting on top of
/// the public filesystem operations maps these to OS error numbers.
#[derive(Error, Debug)]
pub enum LtfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device error: {0}")]
    Device(DeviceError),

    /// Device is fenced after a serious error; revalidate before retrying.
    #[error("device is fenced")]
    DeviceFenced,

    #[error("device is not ready")]
    DeviceUnready,

    #[error("volume is read-only")]
    RdonlyVolume,

    #[error("no space left on tape")]
    NoSpace,

    #[error("free space is below the index write threshold")]
    LessSpace,

    // Format errors
    #[error("invalid partition label: {0}")]
    InvalidLabel(String),

    #[error("partition labels do not match: {0}")]
    LabelMismatch(String),

    #[error("label is damaged but possibly valid")]
    LabelPossibleValid,

    #[error("unsupported index version: {0}")]
    UnsupportedIndexVersion(String),

    #[error("index self/back pointer validation failed")]
    IndexInvalid,

    #[error("no index found on the medium")]
    NoIndex,

    #[error("end of data missing on both partitions")]
    BothEodMissing,

    #[error("volume is inconsistent: {0}")]
    Inconsistent(String),

    #[error("unexpected end of data")]
    UnexpectedEod,

    #[error("unexpected filemark")]
    UnexpectedFilemark,

    // Name errors
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid source path: {0}")]
    InvalidSrcPath(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("entry already exists: {0}")]
    DentryExists(String),

    #[error("no such entry: {0}")]
    NoDentry(String),

    // Semantic errors
    #[error("cannot unlink the root directory")]
    UnlinkRoot,

    #[error("directory is not empty")]
    DirNotEmpty,

    #[error("target is a file")]
    IsFile,

    #[error("target is a directory")]
    IsDirectory,

    #[error("rename would move a directory into itself")]
    RenameLoop,

    #[error("entry is write-protected (immutable or append-only)")]
    WormEnabled,

    // Resource errors
    #[error("null or missing argument: {0}")]
    NullArg(&'static str),

    #[error("bad argument: {0}")]
    BadArg(String),

    #[error("extended attribute value is too large")]
    LargeXattr,

    #[error("buffer is too small")]
    SmallBuffer,

    #[error("operation must be restarted")]
    RestartOperation,

    // Xattr / plugin errors
    #[error("no such extended attribute: {0}")]
    NoXattr(String),

    #[error("extended attribute is read-only: {0}")]
    RdonlyXattr(String),

    #[error("extended attribute already exists: {0}")]
    XattrExists(String),

    #[error("reserved extended attribute namespace: {0}")]
    XattrNamespace(String),

    #[error("plugin does not implement a required operation: {0}")]
    PluginIncomplete(&'static str),

    // Key management
    #[error("no key found for the requested key alias")]
    KeyNotFound,

    #[error("key manager called out of sequence")]
    InvalidSequence,

    #[error("parse error: {0}")]
    Parse(String),
}

impl LtfsError {
    pub fn parse<T: Into<String>>(msg: T) -> Self {
        Self::Parse(msg.into())
    }

    pub fn bad_arg<T: Into<String>>(msg: T) -> Self {
        Self::BadArg(msg.into())
    }

    pub fn invalid_path<T: Into<String>>(msg: T) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn inconsistent<T: Into<String>>(msg: T) -> Self {
        Self::Inconsistent(msg.into())
    }

    pub fn invalid_label<T: Into<String>>(msg: T) -> Self {
        Self::InvalidLabel(msg.into())
    }

    pub fn label_mismatch<T: Into<String>>(msg: T) -> Self {
        Self::LabelMismatch(msg.into())
    }

    /// True when the failure came from the drive rather than the format or
    /// the caller, meaning a revalidate/retry cycle may help.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::Device(_) | Self::DeviceFenced | Self::DeviceUnready
        )
    }
}

impl From<DeviceError> for LtfsError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}
