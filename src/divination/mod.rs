//! Deterministic plum-blossom (梅花易数) casting from time and text.
//!
//! [`generate`] is pure: the same text cast within the same double-hour of
//! the same day always produces the same [`SymbolicResult`]. The only input
//! that varies between calls is the clock, which is injected through
//! [`Clock`] so callers and tests control it.

pub mod trigram;

use chrono::{Datelike, FixedOffset, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub use trigram::{Trigram, hexagram_name};

/// Source of local wall-clock time for casting.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Reads the system clock shifted into a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }
}

/// A clock stuck at one instant. For tests and replaying a cast.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Outcome of a cast. Embedded into the persisted reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolicResult {
    /// Primary hexagram (本卦).
    pub primary_form: String,
    /// Hexagram after the changing line flips (变卦).
    pub secondary_form: String,
    /// Human-readable changing line, e.g. `动爻3`.
    pub changing_line: String,
    /// Changing line position, 1..=6 counted from the bottom.
    pub line: u8,
    pub upper: Trigram,
    pub lower: Trigram,
    /// The running sum the cast was derived from.
    pub seed: i64,
}

/// Earthly-branch year index, 1..=12 (子 = 1). 2024 is 辰, the fifth.
fn year_branch(year: i32) -> u32 {
    // rem_euclid keeps years before 4 AD in range
    (year - 4).rem_euclid(12) as u32 + 1
}

/// Double-hour (时辰) bucket, 1..=12. 23:00–00:59 is 子 = 1.
fn double_hour(hour: u32) -> u32 {
    ((hour + 1) / 2) % 12 + 1
}

/// Cast a hexagram for `text` at local time `now`.
pub fn generate(text: &str, now: NaiveDateTime) -> SymbolicResult {
    let chars = text.chars().count() as u32;
    let base = year_branch(now.year()) + now.month() + now.day() + chars;
    let sum = base + double_hour(now.hour());

    let upper = Trigram::from_index(base);
    let lower = Trigram::from_index(sum);
    let line = match sum % 6 {
        0 => 6,
        n => n as u8,
    };

    let (changed_upper, changed_lower) = if line > 3 {
        (upper.flip(line - 3), lower)
    } else {
        (upper, lower.flip(line))
    };

    SymbolicResult {
        primary_form: hexagram_name(upper, lower).to_string(),
        secondary_form: hexagram_name(changed_upper, changed_lower).to_string(),
        changing_line: format!("动爻{line}"),
        line,
        upper,
        lower,
        seed: i64::from(sum),
    }
}
