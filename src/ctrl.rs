//! Control multiplexer: the escape hatch for operations that do not fit
//! the plain file API. External callers go through [`Tfs::ctrl`] so the
//! internal representations stay free to change.

use alloc::string::String;
use alloc::sync::Arc;

use crate::{
    error::{strerror, TfsError, TfsResult, TfsStatus},
    fd::SeekFrom,
    flags::FileFlags,
    tfs::{CheckReport, Tfs},
    time::SystemHooks,
};

/// Change-log setting. When on, every completed `add`/`unlink`/`link`
/// appends one text line to the named file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeLogMode {
    Off,
    On(String),
}

/// Requests accepted by [`Tfs::ctrl`].
pub enum CtrlOp {
    /// Current position of an open descriptor.
    Tell(usize),
    /// Reposition an open descriptor.
    Seek(usize, SeekFrom),
    /// Fixed message for a status code.
    ErrMsg(TfsStatus),
    /// Compact one device, by index.
    Defrag(usize),
    /// Integrity report for one device, by index.
    Check(usize),
    /// Render a flag word in the mini-language.
    FlagsToStr(u32),
    /// Parse a mini-language string into a flag word.
    StrToFlags(String),
    /// Install replacement system hooks.
    SetHooks(Arc<dyn SystemHooks>),
    /// Switch the change log on or off.
    ChangeLog(ChangeLogMode),
}

/// Values produced by [`Tfs::ctrl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlVal {
    Pos(u32),
    Msg(&'static str),
    Flags(u32),
    Text(String),
    Report(CheckReport),
    Did(bool),
    Unit,
}

impl Tfs {
    pub fn ctrl(&self, op: CtrlOp) -> TfsResult<CtrlVal> {
        match op {
            CtrlOp::Tell(fd) => self.tell(fd).map(CtrlVal::Pos),
            CtrlOp::Seek(fd, whence) => self.seek(fd, whence).map(CtrlVal::Pos),
            CtrlOp::ErrMsg(status) => Ok(CtrlVal::Msg(strerror(status))),
            CtrlOp::Defrag(device) => self.defrag_device(device).map(CtrlVal::Did),
            CtrlOp::Check(device) => self.check(device).map(CtrlVal::Report),
            CtrlOp::FlagsToStr(bits) => {
                let flags = FileFlags::from_bits(bits).ok_or(TfsError::BadArg)?;
                Ok(CtrlVal::Text(flags.to_text()))
            }
            CtrlOp::StrToFlags(text) => {
                FileFlags::from_text(&text).map(|f| CtrlVal::Flags(f.bits()))
            }
            CtrlOp::SetHooks(hooks) => {
                self.set_hooks(hooks);
                Ok(CtrlVal::Unit)
            }
            CtrlOp::ChangeLog(mode) => {
                self.set_change_log(mode);
                Ok(CtrlVal::Unit)
            }
        }
    }
}
