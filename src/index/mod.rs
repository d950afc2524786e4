//! In-memory index and dentry tree model, plus its XML codec.

pub mod types;
pub mod xml;

pub use types::{
    Dentry, DentryData, DentryMeta, DentryTimes, Extent, Index, IndexCriteria, TapePtr, XAttr,
};
