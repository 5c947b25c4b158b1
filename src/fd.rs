//! Open-file sessions. A fixed table of slots tracks position, high-water
//! mark and mode; writers accumulate their payload in RAM and hit flash
//! only at commit, so an aborted handle leaves the media untouched.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{TfsError, TfsResult},
    flags::FileFlags,
    flash::FlashDevice,
    hdr::{align_span, FileHeader, TFSHDRSIZ},
};

/// Historical slot count; monitor commands rely on running out at ten.
pub const TFS_MAXFD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Create,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

pub(crate) struct OpenSlot {
    pub name: String,
    pub info: String,
    pub mode: OpenMode,
    pub device: usize,
    pub flags: FileFlags,
    /// Payload offset on media (readers).
    pub base: u32,
    pub offset: u32,
    pub hwm: u32,
    /// RAM payload (writers).
    pub buf: Option<Vec<u8>>,
    /// Total file storage area of the device, for early impossible-size
    /// rejection; the real space check runs at commit.
    pub capacity: u32,
}

impl OpenSlot {
    pub fn reader(hdr: &FileHeader, device: usize, base: u32, capacity: u32) -> Self {
        OpenSlot {
            name: String::from(hdr.name_str()),
            info: String::new(),
            mode: OpenMode::ReadOnly,
            device,
            flags: hdr.file_flags(),
            base,
            offset: 0,
            hwm: hdr.filsize,
            buf: None,
            capacity,
        }
    }

    pub fn writer(
        name: &str,
        info: &str,
        device: usize,
        mode: OpenMode,
        flags: FileFlags,
        payload: Vec<u8>,
        capacity: u32,
    ) -> Self {
        let hwm = payload.len() as u32;
        OpenSlot {
            name: String::from(name),
            info: String::from(info),
            mode,
            device,
            flags,
            base: 0,
            offset: hwm,
            hwm,
            buf: Some(payload),
            capacity,
        }
    }

    pub fn is_writer(&self) -> bool {
        self.mode != OpenMode::ReadOnly
    }

    pub fn read(&mut self, dev: &dyn FlashDevice, out: &mut [u8]) -> TfsResult<usize> {
        if self.offset >= self.hwm {
            return Ok(0);
        }
        let avail = (self.hwm - self.offset) as usize;
        let n = avail.min(out.len());
        match &self.buf {
            Some(buf) => {
                let start = self.offset as usize;
                out[..n].copy_from_slice(&buf[start..start + n]);
            }
            None => {
                dev.read_at(self.base + self.offset, &mut out[..n])?;
            }
        }
        self.offset += n as u32;
        Ok(n)
    }

    pub fn write(&mut self, data: &[u8]) -> TfsResult<usize> {
        if !self.is_writer() {
            return Err(TfsError::BadArg);
        }
        let projected = self.offset as u64 + data.len() as u64;
        if align_span(TFSHDRSIZ as u64 + projected) > self.capacity as u64 {
            // could never fit even on an empty device
            return Err(TfsError::NoSpace);
        }
        let buf = match &mut self.buf {
            Some(buf) => buf,
            None => return Err(TfsError::BadArg),
        };
        let start = self.offset as usize;
        let overlap = buf.len().saturating_sub(start).min(data.len());
        if data.len() > overlap {
            buf.try_reserve(data.len() - overlap)
                .map_err(|_| TfsError::MemFail)?;
        }
        buf[start..start + overlap].copy_from_slice(&data[..overlap]);
        buf.extend_from_slice(&data[overlap..]);
        self.offset += data.len() as u32;
        self.hwm = buf.len() as u32;
        Ok(data.len())
    }

    pub fn seek(&mut self, whence: SeekFrom) -> TfsResult<u32> {
        let target = match whence {
            SeekFrom::Start(pos) => pos as i64,
            SeekFrom::Current(delta) => self.offset as i64 + delta as i64,
            SeekFrom::End(delta) => self.hwm as i64 + delta as i64,
        };
        if target < 0 || target > self.hwm as i64 {
            return Err(TfsError::BadArg);
        }
        self.offset = target as u32;
        Ok(self.offset)
    }

    pub fn tell(&self) -> u32 {
        self.offset
    }

    pub fn truncate(&mut self, len: u32) -> TfsResult<()> {
        if !self.is_writer() {
            return Err(TfsError::BadArg);
        }
        if len > self.hwm {
            return Err(TfsError::BadArg);
        }
        if let Some(buf) = &mut self.buf {
            buf.truncate(len as usize);
        }
        self.hwm = len;
        if self.offset > len {
            self.offset = len;
        }
        Ok(())
    }
}

pub(crate) struct FdTable {
    slots: [Option<OpenSlot>; TFS_MAXFD],
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            slots: core::array::from_fn(|_| None),
        }
    }

    pub fn insert(&mut self, slot: OpenSlot) -> TfsResult<usize> {
        for (fd, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return Ok(fd);
            }
        }
        Err(TfsError::TooManyOpenFiles)
    }

    pub fn get(&mut self, fd: usize) -> TfsResult<&mut OpenSlot> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.as_mut())
            .ok_or(TfsError::BadArg)
    }

    pub fn take(&mut self, fd: usize) -> TfsResult<OpenSlot> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.take())
            .ok_or(TfsError::BadArg)
    }

    /// Put a slot back at the index `take` emptied, keeping the caller's
    /// descriptor number valid.
    pub fn restore(&mut self, fd: usize, slot: OpenSlot) {
        self.slots[fd] = Some(slot);
    }

    /// Any descriptor, reader or writer, open on the device. Defrag moves
    /// file bytes, so it must not run while one exists.
    pub fn device_busy(&self, device: usize) -> bool {
        self.slots.iter().flatten().any(|s| s.device == device)
    }

    /// One writer per name at a time.
    pub fn writer_open(&self, device: usize, name: &str) -> bool {
        self.slots.iter().flatten().any(|slot| {
            slot.device == device && slot.is_writer() && slot.name == name
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    fn reader_over(payload: &[u8]) -> (alloc::sync::Arc<MemFlash>, OpenSlot) {
        let dev = MemFlash::new(1024, 2);
        dev.write_at(100, payload).unwrap();
        let hdr = FileHeader::new("f", "", FileFlags::empty(), payload.len() as u32, 0, 0)
            .unwrap();
        let slot = OpenSlot::reader(&hdr, 0, 100, 1024);
        (dev, slot)
    }

    #[test]
    fn reader_clamps_at_hwm() {
        let (dev, mut slot) = reader_over(b"hello world");
        let mut buf = [0u8; 8];
        assert_eq!(slot.read(&*dev, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(slot.read(&*dev, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"rld");
        assert_eq!(slot.read(&*dev, &mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_rejects_write() {
        let (_dev, mut slot) = reader_over(b"data");
        assert_eq!(slot.write(b"x"), Err(TfsError::BadArg));
        assert_eq!(slot.truncate(0), Err(TfsError::BadArg));
    }

    fn writer() -> OpenSlot {
        OpenSlot::writer("w", "", 0, OpenMode::Create, FileFlags::empty(), Vec::new(), 4096)
    }

    #[test]
    fn write_extends_and_overwrites() {
        let mut slot = writer();
        assert_eq!(slot.write(b"hello world").unwrap(), 11);
        assert_eq!(slot.hwm, 11);

        slot.seek(SeekFrom::Start(6)).unwrap();
        assert_eq!(slot.write(b"there!!!").unwrap(), 8);
        assert_eq!(slot.hwm, 14);
        assert_eq!(slot.buf.as_deref().unwrap(), b"hello there!!!");
    }

    #[test]
    fn seek_bounds() {
        let mut slot = writer();
        slot.write(b"0123456789").unwrap();
        assert_eq!(slot.seek(SeekFrom::Start(10)).unwrap(), 10);
        assert_eq!(slot.seek(SeekFrom::End(-4)).unwrap(), 6);
        assert_eq!(slot.seek(SeekFrom::Current(2)).unwrap(), 8);
        assert_eq!(slot.seek(SeekFrom::Start(11)), Err(TfsError::BadArg));
        assert_eq!(slot.seek(SeekFrom::Current(-9)), Err(TfsError::BadArg));
        assert_eq!(slot.tell(), 8);
    }

    #[test]
    fn truncate_shrinks_and_clamps_offset() {
        let mut slot = writer();
        slot.write(b"0123456789").unwrap();
        slot.truncate(4).unwrap();
        assert_eq!(slot.hwm, 4);
        assert_eq!(slot.tell(), 4);
        assert_eq!(slot.truncate(5), Err(TfsError::BadArg));
    }

    #[test]
    fn impossible_size_is_nospace_up_front() {
        let mut slot = writer();
        slot.capacity = 256;
        let big = [0u8; 300];
        assert_eq!(slot.write(&big), Err(TfsError::NoSpace));
    }

    #[test]
    fn table_exhaustion() {
        let mut table = FdTable::new();
        for _ in 0..TFS_MAXFD {
            table.insert(writer()).unwrap();
        }
        assert_eq!(table.insert(writer()), Err(TfsError::TooManyOpenFiles));
        let slot = table.take(3).unwrap();
        assert_eq!(slot.name, "w");
        table.insert(writer()).unwrap();
        assert!(table.writer_open(0, "w"));
        assert!(!table.writer_open(1, "w"));
        assert!(table.get(15).is_err());
    }

    #[test]
    fn restore_keeps_the_original_index() {
        let mut table = FdTable::new();
        let first = table.insert(writer()).unwrap();
        let second = table.insert(writer()).unwrap();
        table.take(first).unwrap();

        // with a lower index free, the slot must still go back where it
        // came from, not to the first free entry
        let slot = table.take(second).unwrap();
        table.restore(second, slot);
        assert!(table.get(second).is_ok());
        assert!(table.get(first).is_err());
    }
}
