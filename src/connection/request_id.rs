//! Request Identifiers
//!
//! Single responsibility: hand out strictly increasing 256-bit identifiers
//! and render them for the wire.

use std::fmt;
use std::str::FromStr;

use crate::error::DaemonError;

/// Width of an identifier in bytes.
pub const REQUEST_ID_LEN: usize = 32;

/// A 256-bit big-endian request identifier.
///
/// Ordering follows the numeric value, so ids produced by one
/// [`RequestIdGenerator`] compare strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub const ZERO: Self = Self([0; REQUEST_ID_LEN]);

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }

    /// The value one greater than `self`, wrapping to zero after the maximum.
    fn successor(&self) -> Self {
        let mut bytes = self.0;
        for byte in bytes.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
        Self(bytes)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for RequestId {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| DaemonError::UnknownRequest(format!("{s}: {e}")))?;
        Ok(Self(bytes))
    }
}

/// Counter scoped to one client instance.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last: Option<RequestId>,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `last`.
    pub fn starting_after(last: RequestId) -> Self {
        Self { last: Some(last) }
    }

    pub fn next_id(&mut self) -> RequestId {
        let id = match self.last {
            Some(last) => last.successor(),
            None => RequestId::ZERO.successor(),
        };
        self.last = Some(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let mut ids = RequestIdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(second > first);
        assert_eq!(
            first.to_string(),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_increment_carries_across_bytes() {
        let mut start = [0u8; REQUEST_ID_LEN];
        start[REQUEST_ID_LEN - 1] = 0xff;
        start[REQUEST_ID_LEN - 2] = 0xff;
        let mut ids = RequestIdGenerator::starting_after(RequestId(start));

        let next = ids.next_id();
        assert_eq!(next.as_bytes()[REQUEST_ID_LEN - 3], 1);
        assert_eq!(next.as_bytes()[REQUEST_ID_LEN - 2], 0);
        assert_eq!(next.as_bytes()[REQUEST_ID_LEN - 1], 0);
        assert!(next > RequestId(start));
    }

    #[test]
    fn test_wraps_at_maximum() {
        let mut ids = RequestIdGenerator::starting_after(RequestId([0xff; REQUEST_ID_LEN]));
        assert_eq!(ids.next_id(), RequestId::ZERO);
    }

    #[test]
    fn test_hex_round_trip() {
        let mut ids = RequestIdGenerator::new();
        let id = ids.next_id();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-hex".parse::<RequestId>().is_err());
        assert!("abcd".parse::<RequestId>().is_err());
    }
}
