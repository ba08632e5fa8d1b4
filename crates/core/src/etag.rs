//! Document version stamps
//!
//! An [`Etag`] is a 16-byte, monotonically increasing version stamp attached
//! to every stored document and to every index. It is split into a
//! "restarts" half (bumped when the server restarts) and a "changes" half
//! (bumped on every write).
//!
//! ## Text form
//!
//! Etags travel as 36-character strings: the 16 bytes in big-endian order as
//! upper-case hex, with dashes at positions 8, 13, 18 and 23, e.g.
//! `00000000-0000-0001-0000-00000000002A`.
//!
//! ## Ordering
//!
//! Etags are totally ordered: restarts first, then changes. Staleness
//! cutoffs and the store's last-written etag rely on this ordering.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::DocStoreError;

/// Length of the canonical text form
pub const ETAG_TEXT_LEN: usize = 36;

/// 16-byte document version stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Etag {
    restarts: u64,
    changes: u64,
}

impl Etag {
    /// Create an etag from its two halves
    pub const fn new(restarts: u64, changes: u64) -> Self {
        Etag { restarts, changes }
    }

    /// The all-zero etag
    ///
    /// On a write it means "the document must not exist yet".
    pub const fn empty() -> Self {
        Etag::new(0, 0)
    }

    /// The all-ones etag, never produced by a server
    pub const fn invalid() -> Self {
        Etag::new(u64::MAX, u64::MAX)
    }

    /// High half
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Low half
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// True for [`Etag::empty`]
    pub fn is_empty(&self) -> bool {
        self.restarts == 0 && self.changes == 0
    }

    /// A new etag with `amount` more changes
    pub fn increment_by(&self, amount: u64) -> Etag {
        Etag::new(self.restarts, self.changes.wrapping_add(amount))
    }

    /// Big-endian byte representation
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.restarts.to_be_bytes());
        out[8..].copy_from_slice(&self.changes.to_be_bytes());
        out
    }

    /// Inverse of [`Etag::to_bytes`]
    pub fn from_bytes(bytes: [u8; 16]) -> Etag {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Etag::new(u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }

    /// Parse the canonical 36-character text form
    pub fn parse(text: &str) -> Result<Etag, DocStoreError> {
        if text.is_empty() {
            return Err(DocStoreError::invalid_input("etag text cannot be empty"));
        }
        if text.len() != ETAG_TEXT_LEN {
            return Err(DocStoreError::invalid_input(format!(
                "etag must be {} characters, got {}",
                ETAG_TEXT_LEN,
                text.len()
            )));
        }

        let mut hex = String::with_capacity(32);
        for (i, c) in text.chars().enumerate() {
            if matches!(i, 8 | 13 | 18 | 23) {
                if c != '-' {
                    return Err(DocStoreError::invalid_input(format!(
                        "malformed etag '{}': expected '-' at position {}",
                        text, i
                    )));
                }
                continue;
            }
            if !c.is_ascii_hexdigit() {
                return Err(DocStoreError::invalid_input(format!(
                    "malformed etag '{}': '{}' is not a hex digit",
                    text, c
                )));
            }
            hex.push(c);
        }

        let restarts = u64::from_str_radix(&hex[..16], 16)
            .map_err(|e| DocStoreError::invalid_input(format!("malformed etag '{}': {}", text, e)))?;
        let changes = u64::from_str_radix(&hex[16..], 16)
            .map_err(|e| DocStoreError::invalid_input(format!("malformed etag '{}': {}", text, e)))?;
        Ok(Etag::new(restarts, changes))
    }

    /// Parse, returning `None` for anything malformed
    pub fn try_parse(text: &str) -> Option<Etag> {
        Etag::parse(text).ok()
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:016X}{:016X}", self.restarts, self.changes);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl FromStr for Etag {
    type Err = DocStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Etag::parse(s)
    }
}

impl Serialize for Etag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Etag::parse(&text).map_err(serde::de::Error::custom)
    }
}
