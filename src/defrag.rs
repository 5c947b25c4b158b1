//! Power-safe sector defragmentation.
//!
//! A pass compacts live files toward device offset 0 in chain order, so
//! every relocated byte moves toward the start (`new_off <= old_off`). The
//! whole end state is computed up front and committed to the spare sector
//! as a journal: per-file relocation table, per-sector before/after CRCs,
//! and one stage slot per sector holding the bytes of that sector's final
//! image whose source lies inside the sector itself (everything else is
//! sourced from later, still-untouched sectors). The journal is written
//! once and stays valid until the last sector verifies, so a power cut at
//! any instruction boundary leaves either an untouched device or a journal
//! that replays to the same end state. Stage slots sit at offsets fixed by
//! the plan and hold deterministic content, which makes a torn slot write
//! repairable by reprogramming the same bytes.

use alloc::vec::Vec;

use log::{debug, error, info, warn};
use smallvec::SmallVec;

use crate::{
    crc::Crc32,
    dir,
    error::{TfsError, TfsResult},
    flash::{region_erased, FlashDevice, SectorInfo},
    hdr::{align_span, NEXT_NONE, TFSHDRSIZ},
    time::SystemHooks,
    XFER_SIZE,
};

const JRNL_MAGIC: u32 = u32::from_le_bytes(*b"TFSJ");
const JRNL_VERSION: u16 = 1;
const JRNL_HDR_SIZE: u32 = 20;
const JRNL_OFF_CRC: u32 = 16;
const JRNL_FILE_ENTRY: u32 = 16;
const JRNL_SECTOR_ENTRY: u32 = 16;

/// Where a file's relocated span falls relative to one sector. The file
/// header needs patching (new `next`) only when the span starts in the
/// sector; pure payload continues through the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpanClass {
    Outside,
    Within,
    HeadIn,
    TailIn,
    Covers,
}

impl SpanClass {
    pub fn classify(span_lo: u32, span_hi: u32, sector: &SectorInfo) -> SpanClass {
        if span_hi <= sector.offset || span_lo >= sector.end() {
            return SpanClass::Outside;
        }
        match (span_lo >= sector.offset, span_hi <= sector.end()) {
            (true, true) => SpanClass::Within,
            (true, false) => SpanClass::HeadIn,
            (false, true) => SpanClass::TailIn,
            (false, false) => SpanClass::Covers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlanFile {
    pub old_off: u32,
    pub new_off: u32,
    pub span: u32,
    pub filcrc: u32,
}

impl PlanFile {
    fn delta(&self) -> u32 {
        self.old_off - self.new_off
    }

    fn new_end(&self) -> u32 {
        self.new_off + self.span
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlanSector {
    pub sector: SectorInfo,
    pub before: u32,
    pub after: u32,
    pub stage_crc: u32,
    pub stage_len: u32,
    /// Absolute device offset of this sector's stage slot in the spare.
    pub slot_off: u32,
}

pub(crate) struct DefragPlan {
    pub files: Vec<PlanFile>,
    pub sectors: Vec<PlanSector>,
}

impl DefragPlan {
    fn new_next(&self, idx: usize) -> u32 {
        match self.files.get(idx + 1) {
            Some(f) => f.new_off,
            None => NEXT_NONE,
        }
    }

    pub fn has_work(&self) -> bool {
        self.sectors.iter().any(|s| s.before != s.after)
    }

    /// End of the compacted chain.
    pub fn new_tail(&self) -> u32 {
        self.files.last().map(|f| f.new_end()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefragPhase {
    Inactive,
    Planning,
    Journaled,
    Sweeping(usize),
    AlmostDone,
    AbortRestart,
}

pub(crate) struct Defragger<'a> {
    dev: &'a dyn FlashDevice,
    hooks: &'a dyn SystemHooks,
    phase: DefragPhase,
}

impl<'a> Defragger<'a> {
    pub fn new(dev: &'a dyn FlashDevice, hooks: &'a dyn SystemHooks) -> Self {
        Defragger {
            dev,
            hooks,
            phase: DefragPhase::Inactive,
        }
    }

    fn set_phase(&mut self, phase: DefragPhase) {
        if self.phase != phase {
            debug!("defrag phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Run a full compaction pass. `Ok(false)` means there was nothing to
    /// reclaim. Any pending journal from an earlier interrupted pass is
    /// replayed first.
    pub fn run(&mut self) -> TfsResult<bool> {
        let result = self.run_inner();
        if result.is_err() {
            self.set_phase(DefragPhase::AbortRestart);
        }
        result
    }

    fn run_inner(&mut self) -> TfsResult<bool> {
        if self.resume_inner()? {
            return Ok(true);
        }
        self.set_phase(DefragPhase::Planning);
        let plan = self.plan()?;
        if !plan.has_work() {
            debug!("defrag: nothing to reclaim");
            self.set_phase(DefragPhase::Inactive);
            return Ok(false);
        }
        self.write_journal(&plan)?;
        self.set_phase(DefragPhase::Journaled);
        info!(
            "defrag: journaled {} files over {} sectors, chain tail {:#x}",
            plan.files.len(),
            plan.sectors.len(),
            plan.new_tail()
        );
        self.sweep(&plan)?;
        self.finalize()
    }

    /// Mount-time entry: replay a journaled pass if one is pending,
    /// otherwise restore the erased-spare invariant.
    pub fn resume(&mut self) -> TfsResult<bool> {
        let result = self.resume_inner();
        if result.is_err() {
            self.set_phase(DefragPhase::AbortRestart);
        }
        result
    }

    fn resume_inner(&mut self) -> TfsResult<bool> {
        let plan = match self.read_journal()? {
            Some(plan) => plan,
            None => {
                let spare = self.dev.geometry().spare();
                if !region_erased(self.dev, spare.offset, spare.len as u64)? {
                    // power loss during journal commit: nothing on the
                    // device was touched yet
                    warn!("spare holds no valid journal, erasing");
                    self.dev.erase_sector(spare.index)?;
                }
                return Ok(false);
            }
        };
        info!(
            "defrag: replaying journaled pass, {} files over {} sectors",
            plan.files.len(),
            plan.sectors.len()
        );
        self.set_phase(DefragPhase::Journaled);
        self.sweep(&plan)?;
        self.finalize()?;
        Ok(true)
    }

    fn finalize(&mut self) -> TfsResult<bool> {
        self.set_phase(DefragPhase::AlmostDone);
        let spare = self.dev.geometry().spare();
        self.dev.erase_sector(spare.index)?;
        info!("defrag: complete");
        self.set_phase(DefragPhase::Inactive);
        Ok(true)
    }

    // ---- planning ----

    fn plan(&self) -> TfsResult<DefragPlan> {
        let scan = dir::scan(self.dev)?;
        if let Some(off) = scan.broken_at {
            warn!("defrag: compacting around corrupt region at {:#x}", off);
        }
        let mut files = Vec::new();
        let mut cursor = 0u32;
        for entry in scan.live() {
            let span = entry.hdr.span() as u32;
            files.push(PlanFile {
                old_off: entry.offset,
                new_off: cursor,
                span,
                filcrc: entry.hdr.filcrc,
            });
            cursor += span;
        }

        let mut plan = DefragPlan {
            files,
            sectors: Vec::new(),
        };
        let geometry = self.dev.geometry();
        let spare = geometry.spare();
        let regulars: Vec<SectorInfo> = geometry.regular().to_vec();

        let table_len = JRNL_HDR_SIZE as u64
            + plan.files.len() as u64 * JRNL_FILE_ENTRY as u64
            + regulars.len() as u64 * JRNL_SECTOR_ENTRY as u64;
        let mut slot_cursor = spare.offset as u64 + align_span(table_len);

        for sector in regulars {
            let before = self.crc_of_range(sector.offset, sector.len)?;
            let overlaps = overlapping(&plan.files, &sector);
            let after = self.after_crc(&plan, &sector, &overlaps)?;

            // a sector already in final form is never erased by the
            // sweep, so it needs no stage slot in the spare
            let mut stage_crc = Crc32::new();
            let mut stage_len = 0u32;
            if before != after {
                self.for_each_staged_chunk(&plan, &sector, &overlaps, &mut |chunk| {
                    stage_crc.update(chunk);
                    stage_len += chunk.len() as u32;
                    Ok(())
                })?;
            }

            plan.sectors.push(PlanSector {
                sector,
                before,
                after,
                stage_crc: stage_crc.finish(),
                stage_len,
                slot_off: slot_cursor as u32,
            });
            slot_cursor += align_span(stage_len as u64);
        }

        // the journal is only ever written for a plan with work, so an
        // idle plan is exempt from the spare-size check
        if plan.has_work() && slot_cursor > spare.end() as u64 {
            error!(
                "defrag: state info needs {} bytes past spare end",
                slot_cursor - spare.end() as u64
            );
            return Err(TfsError::DsiMax);
        }
        Ok(plan)
    }

    // ---- journal codec ----

    fn write_journal(&self, plan: &DefragPlan) -> TfsResult<()> {
        let spare = self.dev.geometry().spare();
        self.dev.erase_sector(spare.index)?;

        let mut tables = Vec::new();
        for f in &plan.files {
            tables.extend_from_slice(&f.old_off.to_le_bytes());
            tables.extend_from_slice(&f.new_off.to_le_bytes());
            tables.extend_from_slice(&f.span.to_le_bytes());
            tables.extend_from_slice(&f.filcrc.to_le_bytes());
        }
        let mut stage_total = 0u32;
        for s in &plan.sectors {
            tables.extend_from_slice(&s.before.to_le_bytes());
            tables.extend_from_slice(&s.after.to_le_bytes());
            tables.extend_from_slice(&s.stage_crc.to_le_bytes());
            tables.extend_from_slice(&s.stage_len.to_le_bytes());
            stage_total += align_span(s.stage_len as u64) as u32;
        }
        self.dev.write_at(spare.offset + JRNL_HDR_SIZE, &tables)?;

        let mut hd = [0u8; JRNL_HDR_SIZE as usize];
        hd[0..4].copy_from_slice(&JRNL_MAGIC.to_le_bytes());
        hd[4..6].copy_from_slice(&JRNL_VERSION.to_le_bytes());
        hd[6..8].copy_from_slice(&(plan.sectors.len() as u16).to_le_bytes());
        hd[8..12].copy_from_slice(&(plan.files.len() as u32).to_le_bytes());
        hd[12..16].copy_from_slice(&stage_total.to_le_bytes());
        // crc word stays erased until everything else is on media
        hd[JRNL_OFF_CRC as usize..].fill(0xff);
        self.dev.write_at(spare.offset, &hd)?;

        hd[JRNL_OFF_CRC as usize..].fill(0);
        let mut digest = Crc32::new();
        digest.update(&hd);
        digest.update(&tables);
        self.dev
            .write_at(spare.offset + JRNL_OFF_CRC, &digest.finish().to_le_bytes())
    }

    fn read_journal(&self) -> TfsResult<Option<DefragPlan>> {
        let geometry = self.dev.geometry();
        let spare = geometry.spare();
        let mut hd = [0u8; JRNL_HDR_SIZE as usize];
        self.dev.read_at(spare.offset, &mut hd)?;
        if crate::u32!(hd[0..4]) != JRNL_MAGIC || crate::u16!(hd[4..6]) != JRNL_VERSION {
            return Ok(None);
        }
        let sectors = crate::u16!(hd[6..8]) as usize;
        let files = crate::u32!(hd[8..12]) as usize;
        let jcrc = crate::u32!(hd[16..20]);

        let table_len = files as u64 * JRNL_FILE_ENTRY as u64
            + sectors as u64 * JRNL_SECTOR_ENTRY as u64;
        if JRNL_HDR_SIZE as u64 + table_len > spare.len as u64 {
            return Ok(None);
        }
        let mut tables = alloc::vec![0u8; table_len as usize];
        self.dev.read_at(spare.offset + JRNL_HDR_SIZE, &mut tables)?;

        let mut digest = Crc32::new();
        hd[JRNL_OFF_CRC as usize..].fill(0);
        digest.update(&hd);
        digest.update(&tables);
        if digest.finish() != jcrc {
            return Ok(None);
        }

        if sectors != geometry.regular().len() {
            error!(
                "journal describes {} sectors, device has {}",
                sectors,
                geometry.regular().len()
            );
            return Err(TfsError::Corrupt);
        }

        let mut plan = DefragPlan {
            files: Vec::with_capacity(files),
            sectors: Vec::with_capacity(sectors),
        };
        let mut pos = 0usize;
        for _ in 0..files {
            plan.files.push(PlanFile {
                old_off: crate::u32!(tables[pos..pos + 4]),
                new_off: crate::u32!(tables[pos + 4..pos + 8]),
                span: crate::u32!(tables[pos + 8..pos + 12]),
                filcrc: crate::u32!(tables[pos + 12..pos + 16]),
            });
            pos += JRNL_FILE_ENTRY as usize;
        }
        let table_end = JRNL_HDR_SIZE as u64 + table_len;
        let mut slot_cursor = spare.offset as u64 + align_span(table_end);
        for index in 0..sectors {
            let sector = match geometry.sector(index) {
                Some(info) => info,
                None => return Err(TfsError::Corrupt),
            };
            let stage_len = crate::u32!(tables[pos + 12..pos + 16]);
            plan.sectors.push(PlanSector {
                sector,
                before: crate::u32!(tables[pos..pos + 4]),
                after: crate::u32!(tables[pos + 4..pos + 8]),
                stage_crc: crate::u32!(tables[pos + 8..pos + 12]),
                stage_len,
                slot_off: slot_cursor as u32,
            });
            slot_cursor += align_span(stage_len as u64);
            pos += JRNL_SECTOR_ENTRY as usize;
        }
        Ok(Some(plan))
    }

    // ---- sweep ----

    fn sweep(&mut self, plan: &DefragPlan) -> TfsResult<()> {
        for idx in 0..plan.sectors.len() {
            self.hooks.watchdog();
            self.set_phase(DefragPhase::Sweeping(idx));
            self.sector_step(plan, idx)?;
        }
        Ok(())
    }

    fn sector_step(&mut self, plan: &DefragPlan, idx: usize) -> TfsResult<()> {
        let ps = plan.sectors[idx];
        let current = self.crc_of_range(ps.sector.offset, ps.sector.len)?;
        if current == ps.after {
            debug!("defrag: sector {} already final", ps.sector.index);
            return Ok(());
        }
        let overlaps = overlapping(&plan.files, &ps.sector);

        if ps.stage_len > 0 && !self.slot_valid(&ps)? {
            // the slot must be written before the sector may be erased, so
            // an invalid slot implies the sector still holds its old bytes
            if current != ps.before {
                error!(
                    "defrag: sector {} matches neither before nor after state",
                    ps.sector.index
                );
                return Err(TfsError::Corrupt);
            }
            self.compose_stage(plan, &ps, &overlaps)?;
            if !self.slot_valid(&ps)? {
                error!("defrag: stage slot for sector {} failed readback", ps.sector.index);
                return Err(TfsError::FlashFail);
            }
        }

        self.dev.erase_sector(ps.sector.index)?;
        self.rebuild_sector(plan, &ps, &overlaps)?;

        let rebuilt = self.crc_of_range(ps.sector.offset, ps.sector.len)?;
        if rebuilt != ps.after {
            error!("defrag: sector {} failed verification", ps.sector.index);
            return Err(TfsError::Corrupt);
        }
        info!("defrag: sector {} rebuilt", ps.sector.index);
        Ok(())
    }

    fn slot_valid(&self, ps: &PlanSector) -> TfsResult<bool> {
        if ps.stage_len == 0 {
            return Ok(true);
        }
        Ok(self.crc_of_range(ps.slot_off, ps.stage_len)? == ps.stage_crc)
    }

    fn compose_stage(
        &self,
        plan: &DefragPlan,
        ps: &PlanSector,
        overlaps: &[usize],
    ) -> TfsResult<()> {
        debug!(
            "defrag: staging {} bytes for sector {}",
            ps.stage_len, ps.sector.index
        );
        let dev = self.dev;
        let mut cursor = ps.slot_off;
        self.for_each_staged_chunk(plan, &ps.sector, overlaps, &mut |chunk| {
            dev.write_at(cursor, chunk)?;
            cursor += chunk.len() as u32;
            Ok(())
        })
    }

    fn rebuild_sector(
        &self,
        plan: &DefragPlan,
        ps: &PlanSector,
        overlaps: &[usize],
    ) -> TfsResult<()> {
        let mut slot_cursor = ps.slot_off;
        for &i in overlaps {
            let file = &plan.files[i];
            let (clip_lo, clip_hi) = match SpanClass::classify(file.new_off, file.new_end(), &ps.sector) {
                SpanClass::Outside => continue,
                SpanClass::Within => (file.new_off, file.new_end()),
                SpanClass::HeadIn => (file.new_off, ps.sector.end()),
                SpanClass::TailIn => (ps.sector.offset, file.new_end()),
                SpanClass::Covers => (ps.sector.offset, ps.sector.end()),
            };
            let staged_hi = staged_bound(file, &ps.sector, clip_lo, clip_hi);

            // self-sourced bytes come back from the stage slot
            if staged_hi > clip_lo {
                self.copy_range(slot_cursor, clip_lo, staged_hi - clip_lo)?;
                slot_cursor += staged_hi - clip_lo;
            }

            // the rest still sits untouched in later sectors
            let mut pos = staged_hi;
            let mut buf = [0u8; XFER_SIZE];
            while pos < clip_hi {
                let n = ((clip_hi - pos) as usize).min(XFER_SIZE);
                self.read_final_chunk(file, plan.new_next(i), pos, &mut buf[..n])?;
                self.dev.write_at(pos, &buf[..n])?;
                pos += n as u32;
            }
        }
        Ok(())
    }

    /// Walk the staged extents of one sector in rebuild order, feeding the
    /// final-form bytes (headers already patched) to `sink`.
    fn for_each_staged_chunk(
        &self,
        plan: &DefragPlan,
        sector: &SectorInfo,
        overlaps: &[usize],
        sink: &mut dyn FnMut(&[u8]) -> TfsResult<()>,
    ) -> TfsResult<()> {
        for &i in overlaps {
            let file = &plan.files[i];
            let (clip_lo, clip_hi) = match SpanClass::classify(file.new_off, file.new_end(), sector) {
                SpanClass::Outside => continue,
                SpanClass::Within => (file.new_off, file.new_end()),
                SpanClass::HeadIn => (file.new_off, sector.end()),
                SpanClass::TailIn => (sector.offset, file.new_end()),
                SpanClass::Covers => (sector.offset, sector.end()),
            };
            let staged_hi = staged_bound(file, sector, clip_lo, clip_hi);
            let mut pos = clip_lo;
            let mut buf = [0u8; XFER_SIZE];
            while pos < staged_hi {
                let n = ((staged_hi - pos) as usize).min(XFER_SIZE);
                self.read_final_chunk(file, plan.new_next(i), pos, &mut buf[..n])?;
                sink(&buf[..n])?;
                pos += n as u32;
            }
        }
        Ok(())
    }

    /// CRC of a sector's intended final image: relocated spans plus erased
    /// fill, headers carrying their new `next` values.
    fn after_crc(
        &self,
        plan: &DefragPlan,
        sector: &SectorInfo,
        overlaps: &[usize],
    ) -> TfsResult<u32> {
        let mut digest = Crc32::new();
        let mut cursor = sector.offset;
        for &i in overlaps {
            let file = &plan.files[i];
            let (clip_lo, clip_hi) = match SpanClass::classify(file.new_off, file.new_end(), sector) {
                SpanClass::Outside => continue,
                SpanClass::Within => (file.new_off, file.new_end()),
                SpanClass::HeadIn => (file.new_off, sector.end()),
                SpanClass::TailIn => (sector.offset, file.new_end()),
                SpanClass::Covers => (sector.offset, sector.end()),
            };
            digest.update_erased((clip_lo - cursor) as usize);
            let mut pos = clip_lo;
            let mut buf = [0u8; XFER_SIZE];
            while pos < clip_hi {
                let n = ((clip_hi - pos) as usize).min(XFER_SIZE);
                self.read_final_chunk(file, plan.new_next(i), pos, &mut buf[..n])?;
                digest.update(&buf[..n]);
                pos += n as u32;
            }
            cursor = clip_hi;
        }
        digest.update_erased((sector.end() - cursor) as usize);
        Ok(digest.finish())
    }

    /// Final-image bytes of `file` for destination positions starting at
    /// `dest_pos`, read from the file's old location with the header words
    /// patched in. Callers only ask for ranges whose old bytes are intact.
    fn read_final_chunk(
        &self,
        file: &PlanFile,
        new_next: u32,
        dest_pos: u32,
        out: &mut [u8],
    ) -> TfsResult<()> {
        self.dev.read_at(dest_pos + file.delta(), out)?;
        let rel = (dest_pos - file.new_off) as usize;
        if rel < TFSHDRSIZ {
            let mut hdr = [0u8; TFSHDRSIZ];
            self.dev.read_at(file.old_off, &mut hdr)?;
            hdr[20..24].copy_from_slice(&new_next.to_le_bytes());
            let take = (TFSHDRSIZ - rel).min(out.len());
            out[..take].copy_from_slice(&hdr[rel..rel + take]);
        }
        Ok(())
    }

    fn crc_of_range(&self, offset: u32, len: u32) -> TfsResult<u32> {
        let mut digest = Crc32::new();
        let mut buf = [0u8; XFER_SIZE];
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let n = ((end - pos) as usize).min(XFER_SIZE);
            self.dev.read_at(pos, &mut buf[..n])?;
            digest.update(&buf[..n]);
            pos += n as u32;
        }
        Ok(digest.finish())
    }

    fn copy_range(&self, src: u32, dst: u32, len: u32) -> TfsResult<()> {
        let mut buf = [0u8; XFER_SIZE];
        let mut done = 0u32;
        while done < len {
            let n = ((len - done) as usize).min(XFER_SIZE);
            self.dev.read_at(src + done, &mut buf[..n])?;
            self.dev.write_at(dst + done, &buf[..n])?;
            done += n as u32;
        }
        Ok(())
    }
}

/// Bytes of the clip whose source falls inside the sector being rebuilt:
/// destinations below `sector.end() - delta`.
fn staged_bound(file: &PlanFile, sector: &SectorInfo, clip_lo: u32, clip_hi: u32) -> u32 {
    let limit = sector.end().saturating_sub(file.delta());
    clip_hi.min(limit).max(clip_lo)
}

fn overlapping(files: &[PlanFile], sector: &SectorInfo) -> SmallVec<[usize; 8]> {
    files
        .iter()
        .enumerate()
        .filter(|(_, f)| SpanClass::classify(f.new_off, f.new_end(), sector) != SpanClass::Outside)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        append::{self, AppendRequest},
        flags::FileFlags,
        flash::{DeviceGeometry, MemFlash},
        time::NullHooks,
    };

    fn add(dev: &MemFlash, name: &str, payload: &[u8]) {
        let scan = dir::scan(dev).unwrap();
        let req = AppendRequest {
            name,
            info: "",
            flags: FileFlags::empty(),
            payload,
            modtime: 0,
        };
        append::commit(dev, &scan, &req).unwrap();
    }

    fn unlink(dev: &MemFlash, name: &str) {
        let scan = dir::scan(dev).unwrap();
        let entry = scan.find_live(name).unwrap().clone();
        append::mark_deleted(dev, &entry).unwrap();
    }

    fn live_names(dev: &MemFlash) -> Vec<alloc::string::String> {
        dir::scan(dev)
            .unwrap()
            .live()
            .map(|e| alloc::string::String::from(e.hdr.name_str()))
            .collect()
    }

    fn payload_of(dev: &MemFlash, name: &str) -> Vec<u8> {
        let scan = dir::scan(dev).unwrap();
        let entry = scan.find_live(name).unwrap();
        let mut buf = alloc::vec![0u8; entry.hdr.filsize as usize];
        dev.read_at(entry.payload_offset(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn span_classification() {
        let sector = SectorInfo {
            index: 1,
            offset: 100,
            len: 100,
        };
        assert_eq!(SpanClass::classify(0, 100, &sector), SpanClass::Outside);
        assert_eq!(SpanClass::classify(200, 300, &sector), SpanClass::Outside);
        assert_eq!(SpanClass::classify(100, 200, &sector), SpanClass::Within);
        assert_eq!(SpanClass::classify(120, 160, &sector), SpanClass::Within);
        assert_eq!(SpanClass::classify(150, 250, &sector), SpanClass::HeadIn);
        assert_eq!(SpanClass::classify(50, 150, &sector), SpanClass::TailIn);
        assert_eq!(SpanClass::classify(50, 250, &sector), SpanClass::Covers);
    }

    #[test]
    fn compaction_drops_dead_records() {
        let dev = MemFlash::new(512, 4);
        add(&dev, "a", &[1u8; 100]);
        add(&dev, "b", &[2u8; 200]);
        add(&dev, "c", &[3u8; 50]);
        unlink(&dev, "b");

        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert!(defrag.run().unwrap());

        let scan = dir::scan(&*dev).unwrap();
        assert_eq!(live_names(&dev), ["a", "c"]);
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[0].offset, 0);
        assert_eq!(scan.entries[1].offset as u64, scan.entries[0].hdr.span());
        assert_eq!(payload_of(&dev, "a"), alloc::vec![1u8; 100]);
        assert_eq!(payload_of(&dev, "c"), alloc::vec![3u8; 50]);
        assert!(scan.entries.iter().all(|e| e.hdr.verify_crc()));

        // everything past the tail, and the spare, reads erased
        let end = dev.geometry().storage_end();
        assert!(region_erased(&*dev, scan.tail_free, (end - scan.tail_free) as u64).unwrap());
        let spare = dev.geometry().spare();
        assert!(region_erased(&*dev, spare.offset, spare.len as u64).unwrap());
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let dev = MemFlash::new(512, 4);
        add(&dev, "keep", &[9u8; 300]);
        add(&dev, "drop", &[8u8; 300]);
        unlink(&dev, "drop");

        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert!(defrag.run().unwrap());
        let first = dev.snapshot();

        let mut again = Defragger::new(&*dev, &hooks);
        assert!(!again.run().unwrap());
        assert_eq!(dev.snapshot(), first);
    }

    #[test]
    fn packed_device_plans_without_spare_room() {
        // a chain that is already compact stages nothing, so even a
        // spare too small for one sector's content is acceptable
        let geo = DeviceGeometry::from_sector_lens(&[512, 512, 64]);
        let dev = MemFlash::with_kind(geo, crate::flash::MediaKind::Flash);
        add(&dev, "solid", &[7u8; 700]);

        let before = dev.snapshot();
        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert!(!defrag.run().unwrap());
        assert_eq!(dev.snapshot(), before);
    }

    #[test]
    fn multi_sector_file_relocates_intact() {
        let dev = MemFlash::new(512, 5);
        let body: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        add(&dev, "junk", &[0u8; 420]);
        add(&dev, "big", &body);
        unlink(&dev, "junk");

        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert!(defrag.run().unwrap());

        let scan = dir::scan(&*dev).unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.entries[0].offset, 0);
        assert_eq!(payload_of(&dev, "big"), body);
    }

    #[test]
    fn journal_round_trips_through_spare() {
        let dev = MemFlash::new(512, 4);
        add(&dev, "one", &[1u8; 60]);
        add(&dev, "two", &[2u8; 90]);
        unlink(&dev, "one");

        let hooks = NullHooks;
        let defrag = Defragger::new(&*dev, &hooks);
        let plan = defrag.plan().unwrap();
        assert!(plan.has_work());
        defrag.write_journal(&plan).unwrap();

        let loaded = defrag.read_journal().unwrap().unwrap();
        assert_eq!(loaded.files, plan.files);
        assert_eq!(loaded.sectors, plan.sectors);

        // a cleared spare no longer decodes
        dev.erase_sector(dev.geometry().spare().index).unwrap();
        assert!(defrag.read_journal().unwrap().is_none());
    }

    #[test]
    fn oversized_state_info_fails_before_touching_media() {
        // spare far too small to hold the journal plus one sector's stage
        let geo = DeviceGeometry::from_sector_lens(&[512, 512, 64]);
        let dev = MemFlash::with_kind(geo, crate::flash::MediaKind::Flash);
        add(&dev, "pad", &[5u8; 40]);
        add(&dev, "data", &[6u8; 400]);
        unlink(&dev, "pad");

        let before = dev.snapshot();
        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert_eq!(defrag.run(), Err(TfsError::DsiMax));
        assert_eq!(dev.snapshot(), before);
    }

    #[test]
    fn resume_with_erased_spare_is_a_no_op() {
        let dev = MemFlash::new(512, 3);
        add(&dev, "f", &[1u8; 10]);
        let before = dev.snapshot();
        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert!(!defrag.resume().unwrap());
        assert_eq!(dev.snapshot(), before);
    }

    #[test]
    fn torn_journal_commit_gets_cleaned_up() {
        let dev = MemFlash::new(512, 3);
        add(&dev, "f", &[1u8; 10]);
        // half a journal header, crc never programmed
        let spare = dev.geometry().spare();
        dev.write_at(spare.offset, &JRNL_MAGIC.to_le_bytes()).unwrap();

        let hooks = NullHooks;
        let mut defrag = Defragger::new(&*dev, &hooks);
        assert!(!defrag.resume().unwrap());
        assert!(region_erased(&*dev, spare.offset, spare.len as u64).unwrap());
        assert_eq!(live_names(&dev), ["f"]);
    }
}
