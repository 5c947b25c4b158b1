//! Raw storage primitives. The core never touches addresses directly; it
//! speaks `(device, offset)` through [`FlashDevice`], so everything above
//! this module runs unchanged against real flash drivers or the RAM-backed
//! emulator used by the test suite.

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex;

use crate::error::{TfsError, TfsResult};

/// Erased flash reads back as all-ones.
pub const ERASED_BYTE: u8 = 0xff;
pub const ERASED_WORD: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Ram,
    Flash,
    Nvram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorInfo {
    pub index: usize,
    pub offset: u32,
    pub len: u32,
}

impl SectorInfo {
    pub fn end(&self) -> u32 {
        self.offset + self.len
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Sector layout of one device. Sector sizes may be irregular (boot-block
/// parts). The last sector is always the defrag spare and never holds file
/// data.
#[derive(Debug, Clone)]
pub struct DeviceGeometry {
    sectors: Vec<SectorInfo>,
    size: u32,
}

impl DeviceGeometry {
    pub fn uniform(sector_len: u32, sector_count: usize) -> Self {
        let mut sectors = Vec::with_capacity(sector_count);
        let mut offset = 0u32;
        for index in 0..sector_count {
            sectors.push(SectorInfo {
                index,
                offset,
                len: sector_len,
            });
            offset += sector_len;
        }
        DeviceGeometry {
            sectors,
            size: offset,
        }
    }

    pub fn from_sector_lens(lens: &[u32]) -> Self {
        let mut sectors = Vec::with_capacity(lens.len());
        let mut offset = 0u32;
        for (index, &len) in lens.iter().enumerate() {
            sectors.push(SectorInfo { index, offset, len });
            offset += len;
        }
        DeviceGeometry {
            sectors,
            size: offset,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn sectors(&self) -> &[SectorInfo] {
        &self.sectors
    }

    pub fn sector(&self, index: usize) -> Option<SectorInfo> {
        self.sectors.get(index).copied()
    }

    /// Sector containing `offset`.
    pub fn sector_of(&self, offset: u32) -> Option<SectorInfo> {
        self.sectors.iter().find(|s| s.contains(offset)).copied()
    }

    /// The reserved spare, by convention the last sector.
    pub fn spare(&self) -> SectorInfo {
        self.sectors[self.sectors.len() - 1]
    }

    /// Regular sectors, spare excluded.
    pub fn regular(&self) -> &[SectorInfo] {
        &self.sectors[..self.sectors.len() - 1]
    }

    /// End of the file storage area (= start of the spare).
    pub fn storage_end(&self) -> u32 {
        self.spare().offset
    }
}

/// Read/write/erase primitive a device driver must provide. Writes to
/// Flash-kind media may assume the target range is erased; programming can
/// only clear bits.
pub trait FlashDevice: Send + Sync {
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> TfsResult<()>;
    fn write_at(&self, offset: u32, data: &[u8]) -> TfsResult<()>;
    fn erase_sector(&self, index: usize) -> TfsResult<()>;
    fn geometry(&self) -> &DeviceGeometry;
    fn kind(&self) -> MediaKind;
}

/// True when the whole range reads back as erased flash.
pub fn region_erased(dev: &dyn FlashDevice, offset: u32, len: u64) -> TfsResult<bool> {
    let mut buf = [ERASED_BYTE; crate::XFER_SIZE];
    let mut pos = offset as u64;
    let end = offset as u64 + len;
    while pos < end {
        let n = ((end - pos) as usize).min(buf.len());
        dev.read_at(pos as u32, &mut buf[..n])?;
        if buf[..n].iter().any(|&b| b != ERASED_BYTE) {
            return Ok(false);
        }
        pos += n as u64;
    }
    Ok(true)
}

/// RAM-backed device emulator. The Flash kind reproduces NOR program
/// physics (write ANDs into the existing content), so any violation of the
/// erase-before-write discipline shows up as corrupted bytes instead of
/// silently working. Snapshots support power-cut rehearsals.
pub struct MemFlash {
    geometry: DeviceGeometry,
    kind: MediaKind,
    data: Mutex<Vec<u8>>,
}

impl MemFlash {
    /// Uniform Flash-kind device, fully erased.
    pub fn new(sector_len: u32, sector_count: usize) -> Arc<Self> {
        Self::with_kind(DeviceGeometry::uniform(sector_len, sector_count), MediaKind::Flash)
    }

    pub fn with_kind(geometry: DeviceGeometry, kind: MediaKind) -> Arc<Self> {
        let size = geometry.size() as usize;
        Arc::new(MemFlash {
            geometry,
            kind,
            data: Mutex::new(vec![ERASED_BYTE; size]),
        })
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Roll the media back to a snapshot, as a power cut would leave it.
    pub fn restore(&self, image: &[u8]) -> TfsResult<()> {
        let mut data = self.data.lock();
        if image.len() != data.len() {
            return Err(TfsError::BadArg);
        }
        data.copy_from_slice(image);
        Ok(())
    }

    fn check_range(&self, offset: u32, len: usize) -> TfsResult<()> {
        // 64-bit math so offset + len cannot wrap on 32-bit targets
        let end = offset as u64 + len as u64;
        if end > self.geometry.size() as u64 {
            return Err(TfsError::BadArg);
        }
        Ok(())
    }
}

impl FlashDevice for MemFlash {
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> TfsResult<()> {
        self.check_range(offset, buf.len())?;
        let data = self.data.lock();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u32, bytes: &[u8]) -> TfsResult<()> {
        self.check_range(offset, bytes.len())?;
        let mut data = self.data.lock();
        let start = offset as usize;
        match self.kind {
            MediaKind::Flash => {
                for (cell, &byte) in data[start..start + bytes.len()].iter_mut().zip(bytes) {
                    *cell &= byte;
                }
            }
            MediaKind::Ram | MediaKind::Nvram => {
                data[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(())
    }

    fn erase_sector(&self, index: usize) -> TfsResult<()> {
        let sector = self.geometry.sector(index).ok_or(TfsError::BadArg)?;
        let mut data = self.data.lock();
        let start = sector.offset as usize;
        let end = sector.end() as usize;
        data[start..end].fill(ERASED_BYTE);
        Ok(())
    }

    fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}
