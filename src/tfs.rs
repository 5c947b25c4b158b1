//! The TFS service: registered devices, the descriptor table, and the
//! public file API on top of the chain primitives.
//!
//! Names may be device-qualified (`//FLASH/boot`); unqualified names
//! search devices in registration order. All state lives in [`Tfs`], so
//! independent instances coexist; the process-wide handle in `lib.rs` is
//! opt-in.

use alloc::{
    format,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::{
    append::{self, AppendRequest},
    crc::Crc32,
    ctrl::ChangeLogMode,
    defrag::Defragger,
    dir::{self, ChainEntry},
    error::{TfsError, TfsResult},
    fd::{FdTable, OpenMode, OpenSlot, SeekFrom},
    flags::FileFlags,
    flash::{region_erased, FlashDevice},
    hdr::{align_span, TFSHDRSIZ, TFS_NAMESIZE},
    time::{NullHooks, SystemHooks, TIME_UNSET},
    XFER_SIZE,
};

/// Most symlink hops one lookup will follow.
const SYMLINK_DEPTH: usize = 8;

/// One registered storage device.
struct TfsDevice {
    prefix: String,
    dev: Arc<dyn FlashDevice>,
    needs_fixup: bool,
}

struct TfsInner {
    devices: Vec<TfsDevice>,
    fds: FdTable,
    hooks: Arc<dyn SystemHooks>,
    change_log: ChangeLogMode,
    logging_change: bool,
}

/// Flat file system over one or more flash devices.
pub struct Tfs {
    inner: Mutex<TfsInner>,
}

/// Directory entry snapshot returned by `stat` and `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub name: String,
    pub info: String,
    pub size: u32,
    pub flags: u32,
    pub flag_text: String,
    pub filcrc: u32,
    pub modtime: u32,
    pub device: usize,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Binary,
    Script,
}

/// Outcome of a read-only integrity walk over one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub live: u32,
    pub stale: u32,
    pub deleted: u32,
    pub bytes_live: u64,
    pub bytes_dead: u64,
    pub first_error: Option<String>,
    /// The chain is broken past `first_error`; a defrag pass will rebuild.
    pub needs_fixup: bool,
}

impl CheckReport {
    /// Render for monitor transports that want structured output.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Tfs {
    pub fn new() -> Self {
        Tfs {
            inner: Mutex::new(TfsInner {
                devices: Vec::new(),
                fds: FdTable::new(),
                hooks: Arc::new(NullHooks),
                change_log: ChangeLogMode::Off,
                logging_change: false,
            }),
        }
    }

    /// Register a device. Needs at least one regular sector plus the
    /// spare; the prefix must be unique.
    pub fn add_device(&self, prefix: &str, dev: Arc<dyn FlashDevice>) -> TfsResult<usize> {
        if prefix.is_empty() || dev.geometry().sector_count() < 2 {
            return Err(TfsError::BadArg);
        }
        let mut inner = self.inner.lock();
        if inner.devices.iter().any(|d| d.prefix == prefix) {
            return Err(TfsError::InUse);
        }
        let index = inner.devices.len();
        info!("device {} registered as {}", index, prefix);
        inner.devices.push(TfsDevice {
            prefix: String::from(prefix),
            dev,
            needs_fixup: false,
        });
        Ok(index)
    }

    /// Mount recovery on every registered device.
    pub fn mount_all(&self) -> TfsResult<()> {
        let count = self.inner.lock().devices.len();
        for index in 0..count {
            self.mount_device(index)?;
        }
        Ok(())
    }

    /// Per-device mount recovery: replay or clear a pending defrag
    /// journal, then finish any interrupted stale-marking.
    pub fn mount_device(&self, index: usize) -> TfsResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (dev, prefix) = {
            let d = inner.devices.get(index).ok_or(TfsError::BadArg)?;
            (d.dev.clone(), d.prefix.clone())
        };
        let hooks = inner.hooks.clone();

        let mut defrag = Defragger::new(&*dev, &*hooks);
        if defrag.resume()? {
            info!("{}: journaled defrag pass replayed", prefix);
        }

        let scan = dir::scan(&*dev)?;
        // a crash between a replacement commit and its stale-mark leaves
        // two live entries with one name; the later one wins
        for (i, entry) in scan.entries.iter().enumerate() {
            if !entry.hdr.is_live() {
                continue;
            }
            let superseded = scan.entries[i + 1..]
                .iter()
                .any(|later| later.hdr.is_live() && later.hdr.name_matches(entry.hdr.name_str()));
            if superseded {
                warn!(
                    "{}: staling superseded duplicate {:?}",
                    prefix,
                    entry.hdr.name_str()
                );
                append::mark_stale(&*dev, entry)?;
            }
        }

        let broken = scan.is_broken();
        if broken {
            warn!(
                "{}: chain break at {:#x}, defrag required",
                prefix,
                scan.broken_at.unwrap_or(0)
            );
        }
        inner.devices[index].needs_fixup = broken;
        Ok(())
    }

    /// Open a file. Readers resolve symlinks and are access-checked;
    /// writers buffer in RAM until close.
    pub fn open(&self, name: &str, mode: OpenMode, flags: FileFlags) -> TfsResult<usize> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match mode {
            OpenMode::ReadOnly => {
                let (device, entry) = resolve_link(inner, name)?;
                check_readable(&*inner.hooks, entry.hdr.file_flags())?;
                let capacity = inner.devices[device].dev.geometry().storage_end();
                let slot = OpenSlot::reader(&entry.hdr, device, entry.payload_offset(), capacity);
                inner.fds.insert(slot)
            }
            OpenMode::Create => {
                let (selected, base) = split_device(inner, name);
                if inner.devices.is_empty() || base.is_empty() || base.len() >= TFS_NAMESIZE {
                    return Err(TfsError::BadArg);
                }
                let device = selected.unwrap_or(0);
                if inner.fds.writer_open(device, base) {
                    return Err(TfsError::InUse);
                }
                let capacity = inner.devices[device].dev.geometry().storage_end();
                let slot = OpenSlot::writer(
                    base,
                    "",
                    device,
                    OpenMode::Create,
                    flags,
                    Vec::new(),
                    capacity,
                );
                inner.fds.insert(slot)
            }
            OpenMode::Append => {
                let (device, entry) = locate_live(inner, name)?;
                check_readable(&*inner.hooks, entry.hdr.file_flags())?;
                if inner.fds.writer_open(device, entry.hdr.name_str()) {
                    return Err(TfsError::InUse);
                }
                let dev = inner.devices[device].dev.clone();
                let payload = read_payload(&*dev, &entry)?;
                let capacity = dev.geometry().storage_end();
                let slot = OpenSlot::writer(
                    entry.hdr.name_str(),
                    entry.hdr.info_str(),
                    device,
                    OpenMode::Append,
                    entry.hdr.file_flags(),
                    payload,
                    capacity,
                );
                inner.fds.insert(slot)
            }
        }
    }

    /// Close a descriptor. Writers commit the buffered payload as the new
    /// record and stale whatever entry it replaces; `info` overrides the
    /// text captured at open. On error the descriptor stays open so the
    /// caller may free space and retry, or abort.
    pub fn close(&self, fd: usize, info: Option<&str>) -> TfsResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut slot = inner.fds.take(fd)?;
        if !slot.is_writer() {
            return Ok(());
        }
        let payload = slot.buf.take().unwrap_or_default();
        let info_text = match info {
            Some(text) => String::from(text),
            None => slot.info.clone(),
        };
        match commit_record(inner, slot.device, &slot.name, &info_text, slot.flags, &payload) {
            Ok(()) => {
                info!("close {:?}, {} bytes committed", slot.name, payload.len());
                change_log(inner, "add", &slot.name);
                Ok(())
            }
            Err(e) => {
                slot.buf = Some(payload);
                inner.fds.restore(fd, slot);
                Err(e)
            }
        }
    }

    /// Release a descriptor without touching media.
    pub fn abort(&self, fd: usize) -> TfsResult<()> {
        self.inner.lock().fds.take(fd).map(|_| ())
    }

    pub fn read(&self, fd: usize, out: &mut [u8]) -> TfsResult<usize> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let device = inner.fds.get(fd)?.device;
        let dev = inner.devices[device].dev.clone();
        inner.fds.get(fd)?.read(&*dev, out)
    }

    pub fn write(&self, fd: usize, data: &[u8]) -> TfsResult<usize> {
        self.inner.lock().fds.get(fd)?.write(data)
    }

    pub fn seek(&self, fd: usize, whence: SeekFrom) -> TfsResult<u32> {
        self.inner.lock().fds.get(fd)?.seek(whence)
    }

    pub fn tell(&self, fd: usize) -> TfsResult<u32> {
        Ok(self.inner.lock().fds.get(fd)?.tell())
    }

    pub fn truncate(&self, fd: usize, len: u32) -> TfsResult<()> {
        self.inner.lock().fds.get(fd)?.truncate(len)
    }

    /// Atomic create-or-replace.
    pub fn add(&self, name: &str, info: &str, flags: FileFlags, data: &[u8]) -> TfsResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (selected, base) = split_device(inner, name);
        if inner.devices.is_empty() {
            return Err(TfsError::BadArg);
        }
        let device = selected.unwrap_or(0);
        if inner.fds.writer_open(device, base) {
            return Err(TfsError::InUse);
        }
        commit_record(inner, device, base, info, flags, data)?;
        info!("add {:?}, {} bytes", base, data.len());
        change_log(inner, "add", base);
        Ok(())
    }

    /// Mark a live file deleted in place. The record's bytes stay until
    /// the next defrag pass.
    pub fn unlink(&self, name: &str) -> TfsResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (device, entry) = locate_live(inner, name)?;
        if inner.fds.writer_open(device, entry.hdr.name_str()) {
            return Err(TfsError::InUse);
        }
        if inner.hooks.user_level() < entry.hdr.file_flags().user_level() {
            return Err(TfsError::UserDenied);
        }
        let dev = inner.devices[device].dev.clone();
        append::mark_deleted(&*dev, &entry)?;
        info!("unlink {:?}", entry.hdr.name_str());
        change_log(inner, "rm", entry.hdr.name_str());
        Ok(())
    }

    /// Create a symlink record whose payload names `target`.
    pub fn link(&self, name: &str, target: &str) -> TfsResult<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (selected, base) = split_device(inner, name);
        if inner.devices.is_empty() || target.is_empty() {
            return Err(TfsError::BadArg);
        }
        let device = selected.unwrap_or(0);
        if inner.fds.writer_open(device, base) {
            return Err(TfsError::InUse);
        }
        commit_record(
            inner,
            device,
            base,
            "",
            FileFlags::SYMLINK,
            target.as_bytes(),
        )?;
        info!("link {:?} -> {:?}", base, target);
        change_log(inner, "ln", base);
        Ok(())
    }

    /// Report the named record itself, symlinks unresolved.
    pub fn stat(&self, name: &str) -> TfsResult<StatInfo> {
        let inner = self.inner.lock();
        let (device, entry) = locate_live(&inner, name)?;
        Ok(stat_of(device, &entry))
    }

    /// Report the record a name resolves to after following symlinks.
    pub fn stat_follow(&self, name: &str) -> TfsResult<StatInfo> {
        let inner = self.inner.lock();
        let (device, entry) = resolve_link(&inner, name)?;
        Ok(stat_of(device, &entry))
    }

    /// Live files on one device, alphabetically.
    pub fn list(&self, device: usize) -> TfsResult<Vec<StatInfo>> {
        let inner = self.inner.lock();
        let dev = inner
            .devices
            .get(device)
            .ok_or(TfsError::BadArg)?
            .dev
            .clone();
        let scan = dir::scan(&*dev)?;
        Ok(scan
            .sorted_index()
            .into_iter()
            .map(|entry| stat_of(device, entry))
            .collect())
    }

    /// Compact one device. `Ok(true)` when a pass ran, `Ok(false)` when
    /// there was nothing to reclaim.
    pub fn defrag_device(&self, device: usize) -> TfsResult<bool> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let dev = inner
            .devices
            .get(device)
            .ok_or(TfsError::BadArg)?
            .dev
            .clone();
        if inner.fds.device_busy(device) {
            return Err(TfsError::InUse);
        }
        let hooks = inner.hooks.clone();
        let mut defrag = Defragger::new(&*dev, &*hooks);
        let did = defrag.run()?;
        inner.devices[device].needs_fixup = false;
        Ok(did)
    }

    /// Read-only integrity walk: header chain plus payload CRCs.
    pub fn check(&self, device: usize) -> TfsResult<CheckReport> {
        let inner = self.inner.lock();
        let d = inner.devices.get(device).ok_or(TfsError::BadArg)?;
        let dev = d.dev.clone();
        let flagged = d.needs_fixup;
        let scan = dir::scan(&*dev)?;
        let mut report = CheckReport::default();
        for entry in &scan.entries {
            let flags = entry.hdr.file_flags();
            let span = entry.hdr.span();
            if flags.is_live() {
                report.live += 1;
                report.bytes_live += span;
                if payload_crc(&*dev, entry)? != entry.hdr.filcrc && report.first_error.is_none()
                {
                    report.first_error = Some(format!(
                        "payload crc mismatch in {:?} at {:#x}",
                        entry.hdr.name_str(),
                        entry.offset
                    ));
                }
            } else if flags.is_stale() {
                report.stale += 1;
                report.bytes_dead += span;
            } else {
                report.deleted += 1;
                report.bytes_dead += span;
            }
        }
        if report.first_error.is_none() {
            if let Some(off) = scan.broken_at {
                report.first_error = Some(format!("corrupt header at {:#x}", off));
            }
        }
        report.needs_fixup = flagged || scan.is_broken();
        Ok(report)
    }

    /// `BOOT_RUN` files in chain order, devices in registration order.
    pub fn boot_candidates(&self) -> TfsResult<Vec<String>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for d in &inner.devices {
            let scan = dir::scan(&*d.dev)?;
            for entry in scan.live() {
                if entry.hdr.file_flags().contains(FileFlags::BOOT_RUN) {
                    out.push(String::from(entry.hdr.name_str()));
                }
            }
        }
        Ok(out)
    }

    /// What kind of executable a name resolves to.
    pub fn executable_kind(&self, name: &str) -> TfsResult<ExecKind> {
        let inner = self.inner.lock();
        let (_, entry) = resolve_link(&inner, name)?;
        let flags = entry.hdr.file_flags();
        if flags.contains(FileFlags::EXEC_BINARY) {
            Ok(ExecKind::Binary)
        } else if flags.contains(FileFlags::EXEC_SCRIPT) {
            Ok(ExecKind::Script)
        } else {
            Err(TfsError::NotExec)
        }
    }

    pub fn set_hooks(&self, hooks: Arc<dyn SystemHooks>) {
        self.inner.lock().hooks = hooks;
    }

    pub fn set_change_log(&self, mode: ChangeLogMode) {
        self.inner.lock().change_log = mode;
    }
}

impl Default for Tfs {
    fn default() -> Self {
        Tfs::new()
    }
}

fn stat_of(device: usize, entry: &ChainEntry) -> StatInfo {
    StatInfo {
        name: String::from(entry.hdr.name_str()),
        info: String::from(entry.hdr.info_str()),
        size: entry.hdr.filsize,
        flags: entry.hdr.flags,
        flag_text: entry.hdr.file_flags().to_text(),
        filcrc: entry.hdr.filcrc,
        modtime: entry.hdr.modtime,
        device,
        offset: entry.offset,
    }
}

fn check_readable(hooks: &dyn SystemHooks, flags: FileFlags) -> TfsResult<()> {
    if flags.contains(FileFlags::UNREADABLE) || hooks.user_level() < flags.user_level() {
        return Err(TfsError::UserDenied);
    }
    Ok(())
}

/// Split a device-qualified name into its device index and base name.
fn split_device<'n>(inner: &TfsInner, name: &'n str) -> (Option<usize>, &'n str) {
    for (i, d) in inner.devices.iter().enumerate() {
        if let Some(rest) = name.strip_prefix(d.prefix.as_str()) {
            return (Some(i), rest);
        }
    }
    (None, name)
}

/// Find the live entry a name refers to, searching devices in order when
/// the name carries no device prefix. Does not follow symlinks.
fn locate_live(inner: &TfsInner, name: &str) -> TfsResult<(usize, ChainEntry)> {
    let (selected, base) = split_device(inner, name);
    for (i, d) in inner.devices.iter().enumerate() {
        if let Some(wanted) = selected {
            if wanted != i {
                continue;
            }
        }
        let scan = dir::scan(&*d.dev)?;
        if let Some(entry) = scan.find_live(base) {
            return Ok((i, entry.clone()));
        }
    }
    Err(TfsError::NoFile)
}

fn resolve_link(inner: &TfsInner, name: &str) -> TfsResult<(usize, ChainEntry)> {
    let mut current = String::from(name);
    for _ in 0..SYMLINK_DEPTH {
        let (device, entry) = locate_live(inner, &current)?;
        if !entry.hdr.file_flags().contains(FileFlags::SYMLINK) {
            return Ok((device, entry));
        }
        let dev = inner.devices[device].dev.clone();
        current = read_link_target(&*dev, &entry)?;
    }
    warn!("symlink chain from {:?} exceeds depth {}", name, SYMLINK_DEPTH);
    Err(TfsError::NoFile)
}

fn read_link_target(dev: &dyn FlashDevice, entry: &ChainEntry) -> TfsResult<String> {
    let buf = read_payload(dev, entry)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let target = core::str::from_utf8(&buf[..end]).map_err(|_| TfsError::Corrupt)?;
    Ok(String::from(target))
}

fn read_payload(dev: &dyn FlashDevice, entry: &ChainEntry) -> TfsResult<Vec<u8>> {
    let len = entry.hdr.filsize as usize;
    let mut buf = Vec::new();
    buf.try_reserve(len).map_err(|_| TfsError::MemFail)?;
    buf.resize(len, 0);
    dev.read_at(entry.payload_offset(), &mut buf)?;
    Ok(buf)
}

fn payload_crc(dev: &dyn FlashDevice, entry: &ChainEntry) -> TfsResult<u32> {
    let mut digest = Crc32::new();
    let mut buf = [0u8; XFER_SIZE];
    let mut pos = 0u32;
    while pos < entry.hdr.filsize {
        let n = ((entry.hdr.filsize - pos) as usize).min(XFER_SIZE);
        dev.read_at(entry.payload_offset() + pos, &mut buf[..n])?;
        digest.update(&buf[..n]);
        pos += n as u32;
    }
    Ok(digest.finish())
}

/// Append `payload` as the record `name`, compacting first if the tail
/// cannot take it (or holds residue), then stale the replaced entry.
fn commit_record(
    inner: &mut TfsInner,
    device: usize,
    name: &str,
    info: &str,
    flags: FileFlags,
    payload: &[u8],
) -> TfsResult<()> {
    let dev = inner
        .devices
        .get(device)
        .ok_or(TfsError::BadArg)?
        .dev
        .clone();
    let hooks = inner.hooks.clone();
    let modtime = match hooks.now() {
        Some(t) => t.pack(),
        None => TIME_UNSET,
    };

    let mut scan = dir::scan(&*dev)?;
    // replacing a live entry destroys it, so it takes the same level as
    // unlink; the change-log writer runs privileged under its guard
    if !inner.logging_change {
        if let Some(old) = scan.find_live(name) {
            if hooks.user_level() < old.hdr.file_flags().user_level() {
                return Err(TfsError::UserDenied);
            }
        }
    }
    let storage_end = dev.geometry().storage_end();
    let span = align_span(TFSHDRSIZ as u64 + payload.len() as u64);

    let mut clean = append::fits(&scan, storage_end, payload.len())
        && region_erased(&*dev, scan.tail_free, span)?;
    if !clean {
        if inner.fds.device_busy(device) {
            debug!("defrag skipped, open descriptors on device {}", device);
            return Err(TfsError::NoSpace);
        }
        let mut defrag = Defragger::new(&*dev, &*hooks);
        defrag.run()?;
        inner.devices[device].needs_fixup = false;
        scan = dir::scan(&*dev)?;
        clean = append::fits(&scan, storage_end, payload.len())
            && region_erased(&*dev, scan.tail_free, span)?;
        if !clean {
            return Err(TfsError::NoSpace);
        }
    }

    let old = scan.find_live(name).cloned();
    let request = AppendRequest {
        name,
        info,
        flags,
        payload,
        modtime,
    };
    append::commit(&*dev, &scan, &request)?;
    if let Some(old) = old {
        append::mark_stale(&*dev, &old)?;
    }
    Ok(())
}

/// Append one `time op name` line to the change-log file. Runs under a
/// guard that suppresses nested logging and exempts the log file itself
/// from the replace level gate.
fn change_log(inner: &mut TfsInner, op: &str, name: &str) {
    let target = match &inner.change_log {
        ChangeLogMode::On(target) => target.clone(),
        ChangeLogMode::Off => return,
    };
    if inner.logging_change {
        return;
    }
    inner.logging_change = true;
    let result = append_change_line(inner, &target, op, name);
    inner.logging_change = false;
    if let Err(e) = result {
        warn!("change log append failed: {:?}", e);
    }
}

fn append_change_line(inner: &mut TfsInner, target: &str, op: &str, name: &str) -> TfsResult<()> {
    let stamp = match inner.hooks.now() {
        Some(t) => t.to_string(),
        None => String::from("-"),
    };
    let line = format!("{} {} {}\n", stamp, op, name);

    let (device, mut payload) = match locate_live(inner, target) {
        Ok((device, entry)) => {
            let dev = inner.devices[device].dev.clone();
            (device, read_payload(&*dev, &entry)?)
        }
        Err(TfsError::NoFile) => {
            let (selected, _) = split_device(inner, target);
            (selected.unwrap_or(0), Vec::new())
        }
        Err(e) => return Err(e),
    };
    let (_, base) = split_device(inner, target);
    if inner.fds.writer_open(device, base) {
        return Err(TfsError::InUse);
    }
    payload.extend_from_slice(line.as_bytes());
    commit_record(inner, device, base, "change log", FileFlags::empty(), &payload)
}
