//! Packed modification timestamps and the host-environment hook surface.
//! The monitor environment injects clock and user-level providers here;
//! nothing in the core calls the platform directly.

use core::fmt;

use crate::error::{TfsError, TfsResult};

/// Stored when no clock hook is installed (erased-flash value).
pub const TIME_UNSET: u32 = 0xffff_ffff;

const YEAR_BASE: u16 = 2000;
const YEAR_SHIFT: u32 = 26;
const DOY_SHIFT: u32 = 17;
const DOY_MASK: u32 = 0x1ff;
const SOD_MASK: u32 = 0x1ffff;

/// Calendar timestamp packed into one header word: 6 bits year offset,
/// 9 bits day of year, 17 bits second of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfsTime {
    pub year: u16,
    pub day_of_year: u16,
    pub second_of_day: u32,
}

impl TfsTime {
    pub fn new(year: u16, day_of_year: u16, second_of_day: u32) -> TfsResult<TfsTime> {
        if !(YEAR_BASE..YEAR_BASE + 64).contains(&year)
            || !(1..=366).contains(&day_of_year)
            || second_of_day >= 86400
        {
            return Err(TfsError::BadArg);
        }
        Ok(TfsTime {
            year,
            day_of_year,
            second_of_day,
        })
    }

    pub fn pack(&self) -> u32 {
        (((self.year - YEAR_BASE) as u32) << YEAR_SHIFT)
            | ((self.day_of_year as u32) << DOY_SHIFT)
            | self.second_of_day
    }

    /// Decode a header word. `None` for the unset sentinel or a value whose
    /// fields fall outside the calendar ranges.
    pub fn unpack(raw: u32) -> Option<TfsTime> {
        if raw == TIME_UNSET {
            return None;
        }
        let year = YEAR_BASE + (raw >> YEAR_SHIFT) as u16;
        let day_of_year = ((raw >> DOY_SHIFT) & DOY_MASK) as u16;
        let second_of_day = raw & SOD_MASK;
        TfsTime::new(year, day_of_year, second_of_day).ok()
    }
}

impl fmt::Display for TfsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}.{:03}.{:05}",
            self.year, self.day_of_year, self.second_of_day
        )
    }
}

/// Capabilities the embedding monitor provides. The defaults make a bare
/// library instance fully usable: no clock, maximum privilege, no watchdog.
pub trait SystemHooks: Send + Sync {
    fn now(&self) -> Option<TfsTime> {
        None
    }

    /// Current operator level, 0..=3. Gates reads and destruction of
    /// level-protected files.
    fn user_level(&self) -> u8 {
        3
    }

    /// Polled between sectors during long erase/relocation sequences.
    fn watchdog(&self) {}
}

pub struct NullHooks;

impl SystemHooks for NullHooks {}
