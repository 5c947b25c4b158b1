//! Chain traversal. The on-flash header chain is the only ground truth;
//! everything here (walks, lookups, the sorted index) is derived and can be
//! rebuilt at any time by re-walking from device offset 0.

use alloc::vec::Vec;

use log::warn;

use crate::{
    error::{TfsError, TfsResult},
    flash::FlashDevice,
    hdr::{FileHeader, HeaderState, NEXT_NONE, TFSHDRSIZ},
};

#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub offset: u32,
    pub hdr: FileHeader,
}

impl ChainEntry {
    pub fn payload_offset(&self) -> u32 {
        self.offset + TFSHDRSIZ as u32
    }

    pub fn end(&self) -> u32 {
        self.offset + self.hdr.span() as u32
    }
}

/// Restartable lazy walk over one device's header chain. Stops at the
/// erased sentinel or at the first inconsistency, whichever comes first.
pub struct Walker<'a> {
    dev: &'a dyn FlashDevice,
    storage_end: u32,
    cursor: u32,
    done: bool,
    broken_at: Option<u32>,
    device_error: Option<TfsError>,
}

impl<'a> Walker<'a> {
    pub fn new(dev: &'a dyn FlashDevice) -> Self {
        Walker {
            dev,
            storage_end: dev.geometry().storage_end(),
            cursor: 0,
            done: false,
            broken_at: None,
            device_error: None,
        }
    }

    /// Offset of the corrupt header that ended the walk, if any.
    pub fn broken_at(&self) -> Option<u32> {
        self.broken_at
    }

    /// Where the next append would go once the walk has finished.
    pub fn tail_free(&self) -> u32 {
        self.cursor
    }
}

impl Iterator for Walker<'_> {
    type Item = ChainEntry;

    fn next(&mut self) -> Option<ChainEntry> {
        if self.done {
            return None;
        }
        // less than a header's worth of room left is a clean end
        if self.cursor as u64 + TFSHDRSIZ as u64 > self.storage_end as u64 {
            self.done = true;
            return None;
        }
        let mut buf = [0u8; TFSHDRSIZ];
        if let Err(err) = self.dev.read_at(self.cursor, &mut buf) {
            warn!("chain read failed at {:#x}: {}", self.cursor, err);
            self.device_error = Some(err);
            self.done = true;
            return None;
        }
        let hdr = match FileHeader::decode(&buf) {
            HeaderState::EndOfChain => {
                self.done = true;
                return None;
            }
            HeaderState::Corrupt => {
                warn!("corrupt header at {:#x}, chain unusable past here", self.cursor);
                self.broken_at = Some(self.cursor);
                self.done = true;
                return None;
            }
            HeaderState::Valid(hdr) => hdr,
        };
        let end = self.cursor as u64 + hdr.span();
        if end > self.storage_end as u64 {
            warn!("file at {:#x} overruns the storage area", self.cursor);
            self.broken_at = Some(self.cursor);
            self.done = true;
            return None;
        }
        let entry = ChainEntry {
            offset: self.cursor,
            hdr,
        };
        if entry.hdr.next == NEXT_NONE {
            // tail: remember where free space begins
            self.cursor = end as u32;
            self.done = true;
        } else if entry.hdr.next as u64 == end {
            self.cursor = entry.hdr.next;
        } else {
            warn!(
                "bad forward pointer at {:#x}: {:#x} != {:#x}",
                entry.offset, entry.hdr.next, end
            );
            self.broken_at = Some(entry.offset);
            self.done = true;
        }
        Some(entry)
    }
}

/// Eager walk result. Built per operation; never cached across mutations.
#[derive(Debug, Clone)]
pub struct ChainScan {
    pub entries: Vec<ChainEntry>,
    /// First byte of erased space past the tail (0 on an empty chain).
    pub tail_free: u32,
    /// Offset of the tail header whose `next` gets programmed on append.
    pub tail_entry: Option<u32>,
    pub broken_at: Option<u32>,
}

impl ChainScan {
    pub fn is_broken(&self) -> bool {
        self.broken_at.is_some()
    }

    pub fn live(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter().filter(|e| e.hdr.is_live())
    }

    /// Lookup among live entries; on duplicate names the one appended last
    /// wins (it superseded the earlier ones).
    pub fn find_live(&self, name: &str) -> Option<&ChainEntry> {
        self.live().filter(|e| e.hdr.name_matches(name)).last()
    }

    /// Alphabetical listing of live files for display commands.
    pub fn sorted_index(&self) -> Vec<&ChainEntry> {
        let mut index: Vec<&ChainEntry> = self.live().collect();
        index.sort_by(|a, b| a.hdr.name_str().cmp(b.hdr.name_str()));
        index
    }
}

/// Walk the whole chain. Hardware read failures propagate; corruption does
/// not (the scan reports it via `broken_at` instead, per the fixup model).
pub fn scan(dev: &dyn FlashDevice) -> TfsResult<ChainScan> {
    let mut walker = Walker::new(dev);
    let mut entries = Vec::new();
    let mut tail_entry = None;
    for entry in &mut walker {
        tail_entry = Some(entry.offset);
        entries.push(entry);
    }
    if let Some(err) = walker.device_error {
        return Err(err);
    }
    if walker.broken_at().is_some() {
        // appends land after the last good entry only once defrag has
        // reclaimed the garbage past it
        tail_entry = None;
    }
    Ok(ChainScan {
        tail_free: walker.tail_free(),
        broken_at: walker.broken_at(),
        entries,
        tail_entry,
    })
}
