//! On-media file header codec.
//!
//! The 92-byte layout is byte-stable; `hdrvrsn` signals any future format
//! change. The header CRC is computed over a normalized image (crc field
//! zeroed, `next` and the two lifecycle flag bits forced to erased state)
//! so the three legal post-write mutations (linking a successor, staling,
//! unlinking) never invalidate a stored header, and relocation during
//! defrag leaves `hdrcrc` untouched.

use crate::{
    crc::crc32,
    error::{TfsError, TfsResult},
    flags::FileFlags,
    flash::ERASED_WORD,
};

pub const TFSHDRSIZ: usize = 92;
pub const TFS_SIZEMOD: u32 = 16;
pub const TFS_NAMESIZE: usize = 24;
pub const TFS_INFOSIZE: usize = 24;
const RSVD_SIZE: usize = 16;

pub const HDR_VERSION: u16 = 1;
/// hdrsize value read from erased flash: end of chain, not corruption.
pub const HDRSIZE_SENTINEL: u16 = 0xffff;
/// `next` value of the chain tail (erased word, programmed on append).
pub const NEXT_NONE: u32 = ERASED_WORD;

// Field offsets used when programming individual words in place.
pub(crate) const HDR_OFF_FLAGS: u32 = 8;
pub(crate) const HDR_OFF_NEXT: u32 = 20;
pub(crate) const HDR_OFF_HDRCRC: u32 = 24;

const _: () = assert!(28 + TFS_NAMESIZE + TFS_INFOSIZE + RSVD_SIZE == TFSHDRSIZ);
const _: () = assert!(TFSHDRSIZ as u32 % 4 == 0);

/// Round a byte count up to the flash-write alignment modulus.
pub fn align_span(len: u64) -> u64 {
    let m = TFS_SIZEMOD as u64;
    (len + m - 1) & !(m - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub hdrsize: u16,
    pub hdrvrsn: u16,
    pub filsize: u32,
    pub flags: u32,
    pub filcrc: u32,
    pub modtime: u32,
    pub next: u32,
    pub hdrcrc: u32,
    pub name: [u8; TFS_NAMESIZE],
    pub info: [u8; TFS_INFOSIZE],
    pub rsvd: [u8; RSVD_SIZE],
}

/// What a header slot turned out to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderState {
    Valid(FileHeader),
    EndOfChain,
    Corrupt,
}

impl FileHeader {
    /// Fresh header for a file about to be committed. `next` stays erased
    /// until a successor is appended; `hdrcrc` is finalized by the commit
    /// sequence.
    pub fn new(
        name: &str,
        info: &str,
        flags: FileFlags,
        filsize: u32,
        filcrc: u32,
        modtime: u32,
    ) -> TfsResult<FileHeader> {
        if name.is_empty() || name.len() >= TFS_NAMESIZE {
            return Err(TfsError::BadArg);
        }
        if info.len() >= TFS_INFOSIZE {
            return Err(TfsError::BadArg);
        }
        let mut name_buf = [0u8; TFS_NAMESIZE];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());
        let mut info_buf = [0u8; TFS_INFOSIZE];
        info_buf[..info.len()].copy_from_slice(info.as_bytes());
        Ok(FileHeader {
            hdrsize: TFSHDRSIZ as u16,
            hdrvrsn: HDR_VERSION,
            filsize,
            flags: (flags | FileFlags::ACTIVE | FileFlags::NOT_STALE).bits(),
            filcrc,
            modtime,
            next: NEXT_NONE,
            hdrcrc: 0,
            name: name_buf,
            info: info_buf,
            rsvd: [0xff; RSVD_SIZE],
        })
    }

    pub fn encode(&self) -> [u8; TFSHDRSIZ] {
        let mut buf = [0u8; TFSHDRSIZ];
        buf[0..2].copy_from_slice(&self.hdrsize.to_le_bytes());
        buf[2..4].copy_from_slice(&self.hdrvrsn.to_le_bytes());
        buf[4..8].copy_from_slice(&self.filsize.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.filcrc.to_le_bytes());
        buf[16..20].copy_from_slice(&self.modtime.to_le_bytes());
        buf[20..24].copy_from_slice(&self.next.to_le_bytes());
        buf[24..28].copy_from_slice(&self.hdrcrc.to_le_bytes());
        buf[28..52].copy_from_slice(&self.name);
        buf[52..76].copy_from_slice(&self.info);
        buf[76..92].copy_from_slice(&self.rsvd);
        buf
    }

    fn decode_raw(buf: &[u8]) -> FileHeader {
        let mut name = [0u8; TFS_NAMESIZE];
        name.copy_from_slice(&buf[28..52]);
        let mut info = [0u8; TFS_INFOSIZE];
        info.copy_from_slice(&buf[52..76]);
        let mut rsvd = [0u8; RSVD_SIZE];
        rsvd.copy_from_slice(&buf[76..92]);
        FileHeader {
            hdrsize: crate::u16!(buf[0..2]),
            hdrvrsn: crate::u16!(buf[2..4]),
            filsize: crate::u32!(buf[4..8]),
            flags: crate::u32!(buf[8..12]),
            filcrc: crate::u32!(buf[12..16]),
            modtime: crate::u32!(buf[16..20]),
            next: crate::u32!(buf[20..24]),
            hdrcrc: crate::u32!(buf[24..28]),
            name,
            info,
            rsvd,
        }
    }

    /// Decode and classify one header slot. Exactly `hdrsize == 0xffff`
    /// means erased flash past the chain tail; any other malformed value
    /// is corruption.
    pub fn decode(buf: &[u8]) -> HeaderState {
        if buf.len() < TFSHDRSIZ {
            return HeaderState::Corrupt;
        }
        let hdr = FileHeader::decode_raw(buf);
        if hdr.hdrsize == HDRSIZE_SENTINEL {
            return HeaderState::EndOfChain;
        }
        if hdr.hdrsize as usize != TFSHDRSIZ || hdr.hdrvrsn != HDR_VERSION {
            return HeaderState::Corrupt;
        }
        if !hdr.verify_crc() {
            return HeaderState::Corrupt;
        }
        HeaderState::Valid(hdr)
    }

    /// CRC over the normalized header image.
    pub fn calculate_crc(&self) -> u32 {
        let mut norm = self.clone();
        norm.hdrcrc = 0;
        norm.next = NEXT_NONE;
        norm.flags |= (FileFlags::ACTIVE | FileFlags::NOT_STALE).bits();
        crc32(&norm.encode())
    }

    pub fn update_crc(&mut self) {
        self.hdrcrc = self.calculate_crc();
    }

    pub fn verify_crc(&self) -> bool {
        self.hdrcrc == self.calculate_crc()
    }

    pub fn file_flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags)
    }

    pub fn is_live(&self) -> bool {
        self.file_flags().is_live()
    }

    /// Total storage span: header + payload, alignment-rounded.
    pub fn span(&self) -> u64 {
        align_span(TFSHDRSIZ as u64 + self.filsize as u64)
    }

    pub fn name_str(&self) -> &str {
        str_field(&self.name)
    }

    pub fn info_str(&self) -> &str {
        str_field(&self.info)
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name_str() == name
    }
}

fn str_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}
