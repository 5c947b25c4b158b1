//! Tail allocation and the crash-ordered commit sequence. New data only
//! ever lands past the chain tail; the commit point is the final `hdrcrc`
//! word, so an interruption anywhere earlier leaves a slot that fails
//! validation and is reclaimed by the next defrag pass.

use log::{debug, info};

use crate::{
    crc::crc32,
    dir::{ChainEntry, ChainScan},
    error::TfsResult,
    flags::FileFlags,
    flash::FlashDevice,
    hdr::{align_span, FileHeader, HDR_OFF_FLAGS, HDR_OFF_HDRCRC, HDR_OFF_NEXT, TFSHDRSIZ},
};

pub(crate) struct AppendRequest<'a> {
    pub name: &'a str,
    pub info: &'a str,
    pub flags: FileFlags,
    pub payload: &'a [u8],
    pub modtime: u32,
}

/// Bytes still usable at the tail. Zero on a broken chain: nothing may be
/// appended until defrag has reclaimed the garbage past the break.
pub(crate) fn free_space(scan: &ChainScan, storage_end: u32) -> u32 {
    if scan.is_broken() {
        return 0;
    }
    storage_end - scan.tail_free
}

pub(crate) fn fits(scan: &ChainScan, storage_end: u32, payload_len: usize) -> bool {
    let span = align_span(TFSHDRSIZ as u64 + payload_len as u64);
    span <= free_space(scan, storage_end) as u64
}

/// Write header + payload + final CRC at the tail and link the predecessor.
/// The caller has verified fit and that the target range is erased.
pub(crate) fn commit(
    dev: &dyn FlashDevice,
    scan: &ChainScan,
    req: &AppendRequest<'_>,
) -> TfsResult<ChainEntry> {
    let offset = scan.tail_free;
    let mut hdr = FileHeader::new(
        req.name,
        req.info,
        req.flags,
        req.payload.len() as u32,
        crc32(req.payload),
        req.modtime,
    )?;

    // header first, with the crc word left erased
    let mut image = hdr.encode();
    image[HDR_OFF_HDRCRC as usize..HDR_OFF_HDRCRC as usize + 4].fill(0xff);
    dev.write_at(offset, &image)?;

    if !req.payload.is_empty() {
        dev.write_at(offset + TFSHDRSIZ as u32, req.payload)?;
    }

    // commit point
    hdr.update_crc();
    dev.write_at(offset + HDR_OFF_HDRCRC, &hdr.hdrcrc.to_le_bytes())?;

    // make it reachable: program the predecessor's erased next word
    if let Some(tail) = scan.tail_entry {
        dev.write_at(tail + HDR_OFF_NEXT, &offset.to_le_bytes())?;
    }

    info!(
        "appended '{}' at {:#x}, {} bytes",
        req.name,
        offset,
        req.payload.len()
    );
    Ok(ChainEntry { offset, hdr })
}

fn clear_flag_bits(dev: &dyn FlashDevice, entry: &ChainEntry, bits: FileFlags) -> TfsResult<()> {
    let word = entry.hdr.flags & !bits.bits();
    dev.write_at(entry.offset + HDR_OFF_FLAGS, &word.to_le_bytes())
}

/// Supersede an old same-name entry (invalidate-second).
pub(crate) fn mark_stale(dev: &dyn FlashDevice, entry: &ChainEntry) -> TfsResult<()> {
    debug!("staling '{}' at {:#x}", entry.hdr.name_str(), entry.offset);
    clear_flag_bits(dev, entry, FileFlags::NOT_STALE)
}

/// Unlink: clear the active bit in place.
pub(crate) fn mark_deleted(dev: &dyn FlashDevice, entry: &ChainEntry) -> TfsResult<()> {
    debug!("deleting '{}' at {:#x}", entry.hdr.name_str(), entry.offset);
    clear_flag_bits(dev, entry, FileFlags::ACTIVE)
}
