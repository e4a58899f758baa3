//! Time-ordered record identifiers.
//!
//! A [`RecordId`] is an opaque 64-bit value: the high 48 bits are
//! milliseconds since the Cubby epoch (2020-01-01T00:00:00Z), the low
//! 16 bits a per-process sequence. Identifiers generated later always
//! compare greater, so sorting by id is sorting by creation time.
//!
//! The string form is compact lowercase base-36, round-trippable
//! through [`std::fmt::Display`] / [`std::str::FromStr`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Milliseconds between the Unix epoch and 2020-01-01T00:00:00Z.
const CUBBY_EPOCH_MS: i64 = 1_577_836_800_000;

/// Bits reserved for the per-millisecond sequence counter.
const SEQ_BITS: u32 = 16;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

const BASE: u64 = 36;
const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Errors from parsing the string form of a [`RecordId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    /// The input was empty.
    #[error("record id string is empty")]
    Empty,

    /// The input contained a character outside `[0-9a-z]`.
    #[error("record id contains invalid character {0:?}")]
    InvalidDigit(char),

    /// The input encodes a value wider than 64 bits.
    #[error("record id string encodes a value wider than 64 bits")]
    Overflow,
}

/// An opaque, totally ordered, time-ordered entity identifier.
///
/// Two values are reserved for the system roles that always exist:
/// [`RecordId::GUEST`] and [`RecordId::ADMIN`]. Generated identifiers
/// carry a non-zero timestamp component and can never collide with
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u64);

impl RecordId {
    /// The unauthenticated/anonymous actor.
    pub const GUEST: RecordId = RecordId(0);

    /// The operator with elevated privileges.
    pub const ADMIN: RecordId = RecordId(1);

    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The SQLite `INTEGER` representation (bit-cast, order preserved
    /// for every id this process can generate).
    pub const fn to_db(self) -> i64 {
        self.0 as i64
    }

    pub const fn from_db(raw: i64) -> Self {
        Self(raw as u64)
    }

    /// Whether this id names one of the reserved system roles.
    pub const fn is_reserved(self) -> bool {
        self.0 == Self::GUEST.0 || self.0 == Self::ADMIN.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 64 bits never need more than 13 base-36 digits.
        let mut buf = [0u8; 13];
        let mut pos = buf.len();
        let mut rest = self.0;
        loop {
            pos -= 1;
            buf[pos] = DIGITS[(rest % BASE) as usize];
            rest /= BASE;
            if rest == 0 {
                break;
            }
        }
        // The buffer holds ASCII digits only.
        f.write_str(std::str::from_utf8(&buf[pos..]).unwrap())
    }
}

impl FromStr for RecordId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseIdError::Empty);
        }
        let mut value: u64 = 0;
        for c in s.chars() {
            // `to_digit` would also accept uppercase; the encoding is
            // lowercase-only and parsing is strict about it.
            if !c.is_ascii_digit() && !c.is_ascii_lowercase() {
                return Err(ParseIdError::InvalidDigit(c));
            }
            let digit = c
                .to_digit(BASE as u32)
                .ok_or(ParseIdError::InvalidDigit(c))? as u64;
            value = value
                .checked_mul(BASE)
                .and_then(|v| v.checked_add(digit))
                .ok_or(ParseIdError::Overflow)?;
        }
        Ok(Self(value))
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Generates fresh [`RecordId`]s.
///
/// Explicitly constructed and handed to the store rather than living as
/// process-global state. The packed (millis, sequence) word advances
/// with a CAS loop, so ids from one generator are strictly increasing
/// even across threads and across wall-clock regressions. The sequence
/// is seeded randomly at construction to keep two processes started in
/// the same millisecond from colliding.
#[derive(Debug)]
pub struct IdGenerator {
    /// Packed `(millis << SEQ_BITS) | seq` of the last issued id.
    state: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen::<u16>() as u64;
        Self {
            state: AtomicU64::new((now_ms() << SEQ_BITS) | seed),
        }
    }

    pub fn generate(&self) -> RecordId {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let now = now_ms() << SEQ_BITS;
            let next = if now > current {
                now
            } else if (current & SEQ_MASK) < SEQ_MASK {
                current + 1
            } else {
                // Sequence exhausted within one millisecond: borrow from
                // the next millisecond rather than stalling.
                (current | SEQ_MASK) + 1
            };
            if self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return RecordId(next);
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    (Utc::now().timestamp_millis() - CUBBY_EPOCH_MS).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_from_str() {
        for raw in [0u64, 1, 35, 36, 12345, u64::MAX] {
            let id = RecordId::from_u64(raw);
            let parsed: RecordId = id.to_string().parse().expect("should parse own encoding");
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn parse_failures_are_distinct() {
        assert_eq!("".parse::<RecordId>(), Err(ParseIdError::Empty));
        assert_eq!(
            "abc!".parse::<RecordId>(),
            Err(ParseIdError::InvalidDigit('!'))
        );
        // The encoding is lowercase-only; uppercase must not slip
        // through as an alternate spelling of the same id.
        assert_eq!(
            "ABC".parse::<RecordId>(),
            Err(ParseIdError::InvalidDigit('A'))
        );
        assert_eq!(
            "zzzzzzzzzzzzzz".parse::<RecordId>(),
            Err(ParseIdError::Overflow)
        );
    }

    #[test]
    fn generated_ids_are_strictly_increasing() {
        let gen = IdGenerator::new();
        let mut last = gen.generate();
        for _ in 0..10_000 {
            let next = gen.generate();
            assert!(next > last, "{next} did not advance past {last}");
            last = next;
        }
    }

    #[test]
    fn generated_ids_never_collide_with_reserved_ones() {
        let gen = IdGenerator::new();
        let id = gen.generate();
        assert!(!id.is_reserved());
        assert!(id > RecordId::ADMIN);
    }

    #[test]
    fn db_mapping_round_trips() {
        let gen = IdGenerator::new();
        let id = gen.generate();
        assert_eq!(RecordId::from_db(id.to_db()), id);
        assert_eq!(RecordId::GUEST.to_db(), 0);
        assert_eq!(RecordId::ADMIN.to_db(), 1);
    }
}
