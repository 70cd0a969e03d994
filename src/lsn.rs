//! PostgreSQL Log Sequence Number (LSN) type.
//!
//! An LSN is a 64-bit position in the primary's write-ahead log, written as
//! two 32-bit halves in hex separated by a slash (`16/B374D848`). The
//! replica persists its replay position in this text form in the
//! `postgres_pos` table and reads it back at startup, so parsing accepts
//! exactly what formatting can emit: two hex halves of at most eight digits
//! each. Anything else in the position table means the row is corrupt, and
//! resuming from a mangled position would silently skip or replay WAL.

use std::fmt;
use std::str::FromStr;

use crate::error::{EdgeError, Result};

/// PostgreSQL Log Sequence Number.
///
/// Opaque and monotonically non-decreasing; the position persisted with
/// each applied batch is that batch's commit LSN.
///
/// # Example
///
/// ```
/// use pgwire_edge::lsn::Lsn;
///
/// let lsn: Lsn = "16/B374D848".parse().unwrap();
/// assert_eq!(lsn.to_string(), "16/B374D848");
/// assert_eq!(lsn, Lsn(0x16_B374_D848));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero LSN: no position recorded yet.
    pub const ZERO: Lsn = Lsn(0);

    /// Segment half (high 32 bits).
    #[inline]
    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Offset half (low 32 bits).
    #[inline]
    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    /// Parse the `hi/lo` text form, as stored in `postgres_pos` or returned
    /// in the `consistent_point` column of `CREATE_REPLICATION_SLOT`.
    pub fn parse(s: &str) -> Result<Lsn> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| EdgeError::Decode(format!("lsn without '/' separator: '{s}'")))?;
        Ok(Lsn(
            (u64::from(parse_half(hi, "high", s)?) << 32) | u64::from(parse_half(lo, "low", s)?),
        ))
    }
}

/// Each half is a bare 32-bit hex number; more than eight digits cannot have
/// come from a formatted LSN.
fn parse_half(digits: &str, which: &str, whole: &str) -> Result<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return Err(EdgeError::Decode(format!(
            "lsn {which} half out of range in '{whole}'"
        )));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|_| EdgeError::Decode(format!("lsn {which} half not hex in '{whole}'")))
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.hi(), self.lo())
    }
}

impl FromStr for Lsn {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Lsn> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}
