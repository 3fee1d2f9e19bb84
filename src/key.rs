//! # Ring Identifier Arithmetic
//!
//! Keys are 128-bit identifiers on a ring of size 16^32 (= 2^128). Peers and
//! stored values share the same identifier space: a peer is responsible for
//! every key between its predecessor's id (exclusive) and its own id
//! (inclusive), walking clockwise.
//!
//! The one operation everything else leans on is [`Key::in_between`], the
//! clockwise interval test. It must behave correctly when the queried arc
//! wraps past zero, which is why all arithmetic here is wrapping.

use std::fmt;
use std::ops::{Add, Sub};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of hex digits in a full-width ring identifier (ring size 16^32).
pub const KEY_HEX_WIDTH: u32 = 32;

/// A point on the identifier ring.
///
/// Ordered as an unsigned integer; ring-aware comparisons go through
/// [`Key::in_between`]. The textual form is lowercase hex without leading
/// zeros, so a key's printed width varies while the ring size stays fixed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(u128);

impl Key {
    /// Derive a key from arbitrary text by hashing its UTF-8 bytes and
    /// keeping the first 128 bits of the digest.
    pub fn hash(text: &str) -> Self {
        let digest = blake3::hash(text.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Key(u128::from_be_bytes(bytes))
    }

    /// Parse a hexadecimal numeric string as a literal ring position.
    pub fn from_hex(text: &str) -> Result<Self, ParseKeyError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.len() > KEY_HEX_WIDTH as usize {
            return Err(ParseKeyError(text.to_string()));
        }
        u128::from_str_radix(trimmed, 16)
            .map(Key)
            .map_err(|_| ParseKeyError(text.to_string()))
    }

    /// Lowercase hex rendering without leading zeros.
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }

    /// Raw position on the ring.
    pub fn value(self) -> u128 {
        self.0
    }

    /// Clockwise interval membership on the ring.
    ///
    /// - `lower == upper`: the arc is the single point `lower`.
    /// - `lower < upper`: the ordinary interval between them.
    /// - `lower > upper`: the arc wraps past zero, so membership is the
    ///   complement of the opposite (non-wrapping) arc.
    pub fn in_between(self, lower: Key, upper: Key, inclusive: bool) -> bool {
        let (lo, hi, v) = (lower.0, upper.0, self.0);
        if lo == hi {
            return v == lo;
        }
        if lo < hi {
            if inclusive {
                lo <= v && v <= hi
            } else {
                lo < v && v < hi
            }
        } else if inclusive {
            !(hi < v && v < lo)
        } else {
            !(hi <= v && v <= lo)
        }
    }
}

impl From<u128> for Key {
    fn from(value: u128) -> Self {
        Key(value)
    }
}

impl Add<u128> for Key {
    type Output = Key;

    fn add(self, rhs: u128) -> Key {
        Key(self.0.wrapping_add(rhs))
    }
}

impl Sub<u128> for Key {
    type Output = Key;

    fn sub(self, rhs: u128) -> Key {
        Key(self.0.wrapping_sub(rhs))
    }
}

impl Add for Key {
    type Output = Key;

    fn add(self, rhs: Key) -> Key {
        Key(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Key {
    type Output = Key;

    fn sub(self, rhs: Key) -> Key {
        Key(self.0.wrapping_sub(rhs.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:x})", self.0)
    }
}

// Keys travel as hex strings in every wire message.
impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Key::from_hex(&text).map_err(D::Error::custom)
    }
}

/// The string was not a hexadecimal ring identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError(String);

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hex key: {:?}", self.0)
    }
}

impl std::error::Error for ParseKeyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_without_wrap() {
        let key = Key::from(75);
        assert!(key.in_between(Key::from(0), Key::from(99), false));
        let key = Key::from(99);
        assert!(!key.in_between(Key::from(0), Key::from(99), false));
    }

    #[test]
    fn exclusive_with_wrap() {
        let key = Key::from(1);
        assert!(key.in_between(Key::from(75), Key::from(25), false));
        let key = Key::from(25);
        assert!(!key.in_between(Key::from(75), Key::from(25), false));
    }

    #[test]
    fn inclusive_without_wrap() {
        assert!(Key::from(75).in_between(Key::from(0), Key::from(99), true));
        assert!(Key::from(99).in_between(Key::from(0), Key::from(99), true));
    }

    #[test]
    fn inclusive_with_wrap() {
        assert!(Key::from(1).in_between(Key::from(75), Key::from(25), true));
        assert!(Key::from(25).in_between(Key::from(75), Key::from(25), true));
    }

    #[test]
    fn differing_hex_widths() {
        // Keys of different printed widths still live on the same fixed-size
        // ring; this used to be an edge case when the ring size was derived
        // from the hex representation.
        let key = Key::from_hex("f4ee136cb4059b2883450e7e93698be").unwrap();
        let lb = Key::from_hex("633bd46b5c515992a5ce553d0680bec9").unwrap();
        let ub = Key::from_hex("f4ee136cb4059b2883450e7e93698bd").unwrap();
        assert!(!key.in_between(lb, ub, true));
    }

    #[test]
    fn degenerate_arc_is_a_single_point() {
        let point = Key::from(42);
        assert!(point.in_between(point, point, false));
        assert!(point.in_between(point, point, true));
        assert!(!Key::from(43).in_between(point, point, true));
    }

    #[test]
    fn wrapping_arithmetic() {
        let max = Key::from(u128::MAX);
        assert_eq!(max + 1, Key::from(0));
        assert_eq!(Key::from(0) - 1, max);
        assert_eq!((max + 5).value(), 4);
    }

    #[test]
    fn hex_round_trip() {
        let key = Key::hash("some value");
        let parsed = Key::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);

        assert!(Key::from_hex("").is_err());
        assert!(Key::from_hex("zz").is_err());
        assert!(Key::from_hex("f00000000000000000000000000000000").is_err());
    }

    #[test]
    fn hashing_is_stable_and_spreads() {
        assert_eq!(Key::hash("a"), Key::hash("a"));
        assert_ne!(Key::hash("a"), Key::hash("b"));
        assert_ne!(Key::hash("127.0.0.1:5055"), Key::hash("127.0.0.1:5056"));
    }

    #[test]
    fn serde_uses_hex_strings() {
        let key = Key::hash("wire");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    /// For any three distinct ring positions exactly one of the cyclic
    /// exclusive in-between relations holds.
    #[test]
    fn cyclic_exclusive_symmetry() {
        let mut state = 0x9e3779b97f4a7c15u128;
        let mut next = || {
            state = state.wrapping_mul(0x5851f42d4c957f2d).wrapping_add(0x14057b7ef767814f);
            Key::from(state)
        };

        for _ in 0..1_000 {
            let (a, b, c) = (next(), next(), next());
            if a == b || b == c || a == c {
                continue;
            }
            let hits = [
                a.in_between(b, c, false),
                b.in_between(c, a, false),
                c.in_between(a, b, false),
            ]
            .iter()
            .filter(|&&hit| hit)
            .count();
            assert_eq!(hits, 1, "a={a} b={b} c={c}");
        }
    }
}
