//! Table-driven CRC32 (polynomial 0xEDB88320, zlib-compatible). Images
//! written by earlier firmware revisions must keep validating, so the
//! polynomial and bit order are frozen.

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB88320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_table();

/// One-shot CRC32 of a buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut digest = Crc32::new();
    digest.update(data);
    digest.finish()
}

/// Streaming digest for data larger than the transfer buffer (sector
/// images, staged extents).
#[derive(Clone)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Crc32 { state: 0xffff_ffff }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let idx = ((self.state ^ byte as u32) & 0xff) as usize;
            self.state = (self.state >> 8) ^ CRC_TABLE[idx];
        }
    }

    /// Feed `len` bytes of erased flash (0xff) without materializing them.
    pub fn update_erased(&mut self, len: usize) {
        for _ in 0..len {
            let idx = ((self.state ^ 0xff) & 0xff) as usize;
            self.state = (self.state >> 8) ^ CRC_TABLE[idx];
        }
    }

    pub fn finish(&self) -> u32 {
        !self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Crc32::new()
    }
}
