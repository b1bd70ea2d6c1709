#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] IoError),
    #[error("Format: {0}")]
    Format(#[from] FormatError),
    #[error("Resource: {0}")]
    Resource(#[from] ResourceError),
    #[error("Usage: {0}")]
    Usage(#[from] UsageError),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("short read at block {block_no} (wanted {wanted} bytes, got {got})")]
    ShortRead {
        block_no: u32,
        wanted: usize,
        got: usize,
    },
    #[error("short write at block {block_no} (wanted {wanted} bytes, wrote {wrote})")]
    ShortWrite {
        block_no: u32,
        wanted: usize,
        wrote: usize,
    },
    #[error("permission denied")]
    Permission,
    #[error("image is locked by another process")]
    LockContention,
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => IoError::Permission,
            std::io::ErrorKind::WouldBlock => IoError::LockContention,
            _ => IoError::Other(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("word {word:#o} at block {block_no} has garbage in the upper five bits")]
    Corruption { block_no: u32, word: u16 },
    #[error("segment {seg_index} violates invariant: {reason}")]
    InvalidDirectory { seg_index: u8, reason: String },
    #[error("segment chain out of range: next_segment {0}")]
    ChainOutOfRange(u16),
    #[error("segment chain contains a cycle at segment {0}")]
    ChainCycle(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("no empty entry of at least {requested} blocks available")]
    NoEmptyEntry { requested: u16 },
    #[error("no free directory segment to extend the chain (ENOSPC)")]
    NoSpace,
}

#[derive(thiserror::Error, Debug)]
pub enum UsageError {
    #[error("illegal OS/8 name: {0}")]
    IllegalName(String),
    #[error("wrong number of arguments: {0}")]
    WrongArity(String),
    #[error("destination is not a directory: {0}")]
    DestinationNotDirectory(String),
    #[error("zero-length file is not supported: {0}")]
    ZeroLengthFile(String),
}

pub type Result<T> = std::result::Result<T, Error>;
