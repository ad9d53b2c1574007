use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("data corruption in {component}: page={page_num}, {details}")]
    Corruption {
        component: String,
        page_num: u64,
        details: String,
    },

    #[error("data corruption: {details}")]
    DataCorruption { details: String },

    #[error("storage format incompatible: expected version {expected}, found {found}")]
    FormatIncompatible { expected: u16, found: u16 },

    #[error("file is read-only, cannot perform operation: {operation}")]
    DatabaseReadOnly { operation: String },

    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("value too large: {len} bytes (max {max})")]
    ValueTooLarge { len: usize, max: usize },

    #[error("value length mismatch: stored {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("cannot store an empty value")]
    EmptyValue,

    #[error("unknown journal record type: {tag:#04x}")]
    InvalidLogEntry { tag: u8 },

    #[error("journal checksum verification failed at lsn {lsn}")]
    JournalChecksum { lsn: u64 },

    #[error("journal corrupted: {0}")]
    JournalCorrupted(String),

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn corruption(component: &str, page_num: u64, details: impl Into<String>) -> Self {
        Error::Corruption {
            component: component.to_string(),
            page_num,
            details: details.into(),
        }
    }

    pub(crate) fn read_only(operation: &str) -> Self {
        Error::DatabaseReadOnly {
            operation: operation.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidOptions(format!("JSON error: {}", err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

// Fixed-width integer decoding from byte slices
impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::DataCorruption {
            details: "failed to parse binary data".to_string(),
        }
    }
}

pub trait PoisonedLockExt<'a, T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockReadGuard<'a, T>>
    for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        self.unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockWriteGuard<'a, T>>
    for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        self.unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::MutexGuard<'a, T>>
    for std::sync::LockResult<std::sync::MutexGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        self.unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
