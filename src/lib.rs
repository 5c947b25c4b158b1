#![cfg_attr(not(test), no_std)]
extern crate alloc;

// Codec and device primitives
mod crc;
pub mod error;
pub mod flash;
pub mod flags;
pub mod hdr;
pub mod time;

// Chain traversal and file sessions
pub mod dir;
pub mod fd;

// Write path and space reclamation
pub mod append;
pub mod defrag;

// Public service surface
pub mod ctrl;
pub mod tfs;


use alloc::sync::Arc;

use spin::Once;

pub use crate::{
    crc::{crc32, Crc32},
    ctrl::{ChangeLogMode, CtrlOp, CtrlVal},
    error::{strerror, TfsError, TfsResult, TfsStatus},
    fd::{OpenMode, SeekFrom},
    flags::FileFlags,
    flash::{DeviceGeometry, FlashDevice, MediaKind, MemFlash, SectorInfo},
    hdr::{FileHeader, TFSHDRSIZ, TFS_SIZEMOD},
    tfs::{CheckReport, ExecKind, StatInfo, Tfs},
    time::{NullHooks, SystemHooks, TfsTime},
};

static TFS: Once<Arc<Tfs>> = Once::new();

/// Install the process-wide TFS service
pub fn init_tfs(tfs: Tfs) {
    TFS.call_once(|| Arc::new(tfs));
}

/// Handle to the service installed by [`init_tfs`]
pub fn global_tfs() -> Arc<Tfs> {
    TFS.get().unwrap().clone()
}

#[macro_export]
macro_rules! u32 {
    ($x:expr) => {
        u32::from_le_bytes($x.try_into().unwrap())
    };
}

#[macro_export]
macro_rules! u16 {
    ($x:expr) => {
        u16::from_le_bytes($x.try_into().unwrap())
    };
}

#[cfg(feature = "xfer128")]
pub const XFER_SIZE: usize = 128;

#[cfg(all(feature = "xfer256", not(feature = "xfer128")))]
pub const XFER_SIZE: usize = 256;

#[cfg(all(feature = "xfer1k", not(any(feature = "xfer128", feature = "xfer256"))))]
pub const XFER_SIZE: usize = 1024;

#[cfg(all(
    feature = "xfer4k",
    not(any(feature = "xfer128", feature = "xfer256", feature = "xfer1k"))
))]
pub const XFER_SIZE: usize = 4096;

#[cfg(not(any(
    feature = "xfer128",
    feature = "xfer256",
    feature = "xfer1k",
    feature = "xfer4k"
)))]
pub const XFER_SIZE: usize = 256;
