use onlyerror::Error;
use serde::{Deserialize, Serialize};

pub type TfsResult<T> = Result<T, TfsError>;

/// Internal failure domain. Variants stay coarse; call sites log the
/// offsets/names involved before returning one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TfsError {
    /// file not found
    NoFile,
    /// bad file header
    BadHeader,
    /// user level access denied
    UserDenied,
    /// corrupt file system
    Corrupt,
    /// file not executable
    NotExec,
    /// memory allocation failed
    MemFail,
    /// defrag state info exceeds spare sector
    DsiMax,
    /// out of space
    NoSpace,
    /// too many open files
    TooManyOpenFiles,
    /// file in use
    InUse,
    /// invalid argument
    BadArg,
    /// flash operation failed
    FlashFail,
}

/// External status-code domain. Values are stable: monitor commands and
/// loaded applications see these as plain integers.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TfsStatus {
    Okay = 0,
    NoFile = -1,
    BadHdr = -2,
    UserDenied = -3,
    Corrupt = -4,
    NotExec = -5,
    MemFail = -6,
    DsiMax = -7,
    NoSpace = -8,
    TooManyFds = -9,
    InUse = -10,
    BadArg = -11,
    FlashFail = -12,
}

impl TfsStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<TfsStatus> {
        let status = match code {
            0 => TfsStatus::Okay,
            -1 => TfsStatus::NoFile,
            -2 => TfsStatus::BadHdr,
            -3 => TfsStatus::UserDenied,
            -4 => TfsStatus::Corrupt,
            -5 => TfsStatus::NotExec,
            -6 => TfsStatus::MemFail,
            -7 => TfsStatus::DsiMax,
            -8 => TfsStatus::NoSpace,
            -9 => TfsStatus::TooManyFds,
            -10 => TfsStatus::InUse,
            -11 => TfsStatus::BadArg,
            -12 => TfsStatus::FlashFail,
            _ => return None,
        };
        Some(status)
    }
}

impl From<&TfsError> for TfsStatus {
    fn from(err: &TfsError) -> TfsStatus {
        match err {
            TfsError::NoFile => TfsStatus::NoFile,
            TfsError::BadHeader => TfsStatus::BadHdr,
            TfsError::UserDenied => TfsStatus::UserDenied,
            TfsError::Corrupt => TfsStatus::Corrupt,
            TfsError::NotExec => TfsStatus::NotExec,
            TfsError::MemFail => TfsStatus::MemFail,
            TfsError::DsiMax => TfsStatus::DsiMax,
            TfsError::NoSpace => TfsStatus::NoSpace,
            TfsError::TooManyOpenFiles => TfsStatus::TooManyFds,
            TfsError::InUse => TfsStatus::InUse,
            TfsError::BadArg => TfsStatus::BadArg,
            TfsError::FlashFail => TfsStatus::FlashFail,
        }
    }
}

impl From<TfsError> for TfsStatus {
    fn from(err: TfsError) -> TfsStatus {
        TfsStatus::from(&err)
    }
}

/// Fixed message table consumed by monitor commands. The strings are part
/// of the external contract and never change wording.
pub fn strerror(status: TfsStatus) -> &'static str {
    match status {
        TfsStatus::Okay => "okay",
        TfsStatus::NoFile => "file not found",
        TfsStatus::BadHdr => "bad file header",
        TfsStatus::UserDenied => "user level access denied",
        TfsStatus::Corrupt => "corrupt file system",
        TfsStatus::NotExec => "file not executable",
        TfsStatus::MemFail => "memory allocation failed",
        TfsStatus::DsiMax => "defrag state info exceeds spare sector",
        TfsStatus::NoSpace => "out of space",
        TfsStatus::TooManyFds => "too many open files",
        TfsStatus::InUse => "file in use",
        TfsStatus::BadArg => "invalid argument",
        TfsStatus::FlashFail => "flash operation failed",
    }
}
