//! File flag word and the single-character flag language used by monitor
//! commands (`E e c l b u 0-3`). The textual encoding is part of the CLI
//! contract and must round-trip exactly.

use alloc::string::String;

use bitflags::bitflags;

use crate::error::{TfsError, TfsResult};

bitflags! {
    pub struct FileFlags: u32 {
        /// 'E' executable binary image
        const EXEC_BINARY = 1 << 0;
        /// 'e' executable monitor script
        const EXEC_SCRIPT = 1 << 1;
        /// 'c' compressed payload
        const COMPRESSED = 1 << 2;
        /// 'l' payload is the name of another file
        const SYMLINK = 1 << 3;
        /// 'b' run automatically at boot
        const BOOT_RUN = 1 << 4;
        /// 'u' executable-only, not readable
        const UNREADABLE = 1 << 5;
        /// '0'-'3' minimum user level required to read (two bits)
        const ULVL = 3 << 6;
        /// Cleared in place when a newer same-name file is committed.
        /// Erased state is 1, so the clear is a plain NOR program.
        const NOT_STALE = 1 << 30;
        /// Cleared in place by unlink.
        const ACTIVE = 1 << 31;
    }
}

const ULVL_SHIFT: u32 = 6;

impl FileFlags {
    pub fn user_level(self) -> u8 {
        ((self.bits() & FileFlags::ULVL.bits()) >> ULVL_SHIFT) as u8
    }

    pub fn with_user_level(self, level: u8) -> FileFlags {
        let bits = (self.bits() & !FileFlags::ULVL.bits())
            | (((level & 3) as u32) << ULVL_SHIFT);
        FileFlags::from_bits_truncate(bits)
    }

    /// Live means visible to lookups: active and not superseded.
    pub fn is_live(self) -> bool {
        self.contains(FileFlags::ACTIVE | FileFlags::NOT_STALE)
    }

    pub fn is_stale(self) -> bool {
        self.contains(FileFlags::ACTIVE) && !self.contains(FileFlags::NOT_STALE)
    }

    pub fn is_deleted(self) -> bool {
        !self.contains(FileFlags::ACTIVE)
    }

    /// Canonical text form: `E e c l b u` order, then the user level digit
    /// when nonzero. ACTIVE/NOT_STALE never appear in text.
    pub fn to_text(self) -> String {
        let mut text = String::new();
        if self.contains(FileFlags::EXEC_BINARY) {
            text.push('E');
        }
        if self.contains(FileFlags::EXEC_SCRIPT) {
            text.push('e');
        }
        if self.contains(FileFlags::COMPRESSED) {
            text.push('c');
        }
        if self.contains(FileFlags::SYMLINK) {
            text.push('l');
        }
        if self.contains(FileFlags::BOOT_RUN) {
            text.push('b');
        }
        if self.contains(FileFlags::UNREADABLE) {
            text.push('u');
        }
        let level = self.user_level();
        if level != 0 {
            text.push((b'0' + level) as char);
        }
        text
    }

    /// Parse a flag string in any character order. Unknown characters are
    /// rejected rather than ignored.
    pub fn from_text(text: &str) -> TfsResult<FileFlags> {
        let mut flags = FileFlags::empty();
        for ch in text.chars() {
            match ch {
                'E' => flags |= FileFlags::EXEC_BINARY,
                'e' => flags |= FileFlags::EXEC_SCRIPT,
                'c' => flags |= FileFlags::COMPRESSED,
                'l' => flags |= FileFlags::SYMLINK,
                'b' => flags |= FileFlags::BOOT_RUN,
                'u' => flags |= FileFlags::UNREADABLE,
                '0'..='3' => {
                    flags = flags.with_user_level(ch as u8 - b'0');
                }
                _ => return Err(TfsError::BadArg),
            }
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chars_map_to_bits() {
        assert_eq!(
            FileFlags::from_text("E").unwrap(),
            FileFlags::EXEC_BINARY
        );
        assert_eq!(
            FileFlags::from_text("e").unwrap(),
            FileFlags::EXEC_SCRIPT
        );
        assert_eq!(FileFlags::from_text("c").unwrap(), FileFlags::COMPRESSED);
        assert_eq!(FileFlags::from_text("l").unwrap(), FileFlags::SYMLINK);
        assert_eq!(FileFlags::from_text("b").unwrap(), FileFlags::BOOT_RUN);
        assert_eq!(FileFlags::from_text("u").unwrap(), FileFlags::UNREADABLE);
    }

    #[test]
    fn mask_to_text_to_mask_is_identity() {
        let combos = [
            FileFlags::empty(),
            FileFlags::EXEC_BINARY,
            FileFlags::EXEC_SCRIPT | FileFlags::BOOT_RUN,
            FileFlags::COMPRESSED | FileFlags::UNREADABLE,
            FileFlags::SYMLINK,
            (FileFlags::EXEC_BINARY | FileFlags::COMPRESSED).with_user_level(2),
            FileFlags::empty().with_user_level(3),
        ];
        for flags in combos {
            let text = flags.to_text();
            assert_eq!(FileFlags::from_text(&text).unwrap(), flags, "via {:?}", text);
        }
    }

    #[test]
    fn parse_accepts_any_order() {
        let a = FileFlags::from_text("E2c").unwrap();
        let b = FileFlags::from_text("c2E").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_text(), "Ec2");
    }

    #[test]
    fn unknown_char_rejected() {
        assert_eq!(FileFlags::from_text("Ex"), Err(TfsError::BadArg));
        assert_eq!(FileFlags::from_text("4"), Err(TfsError::BadArg));
    }

    #[test]
    fn text_never_encodes_lifecycle_bits() {
        let flags = FileFlags::ACTIVE | FileFlags::NOT_STALE | FileFlags::EXEC_SCRIPT;
        assert_eq!(flags.to_text(), "e");
    }

    #[test]
    fn lifecycle_states() {
        let live = FileFlags::ACTIVE | FileFlags::NOT_STALE;
        assert!(live.is_live());
        assert!(!live.is_stale());
        assert!(!live.is_deleted());

        let stale = FileFlags::ACTIVE;
        assert!(stale.is_stale());
        assert!(!stale.is_live());

        let deleted = FileFlags::NOT_STALE;
        assert!(deleted.is_deleted());
        assert!(!deleted.is_live());
    }

    #[test]
    fn user_level_round_trip() {
        for level in 0..=3u8 {
            let flags = FileFlags::empty().with_user_level(level);
            assert_eq!(flags.user_level(), level);
        }
    }
}
