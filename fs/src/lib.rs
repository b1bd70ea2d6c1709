//! OS/8 directory engine: packed-directory parsing, allocation and mutation
//! over a [`os8_ds::DataStorage`] image.

pub use os8_err::{Error, FormatError, IoError, ResourceError, Result, UsageError};

pub mod codec;
pub mod device;
pub mod directory;
pub mod engine;
pub mod image;
pub mod pattern;
pub mod stream;
