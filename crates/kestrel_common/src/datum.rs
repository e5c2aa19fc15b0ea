//! The `Datum` value model: the opaque typed cell the B-tree stores.
//!
//! `Null` is a distinct value, not an absence; it sorts before everything
//! else. The byte encoding is order-preserving (comparing encodings gives
//! the same order as comparing datums) so leaf images can be compared
//! without decoding.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Variant rank used for cross-variant ordering: Null < Int < Text < Bytes.
    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Int(_) => 1,
            Datum::Text(_) => 2,
            Datum::Bytes(_) => 3,
        }
    }

    /// Order-preserving encoding: tag byte, then a big-endian payload with
    /// sign flip for integers so that byte order equals value order.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Datum::Null => buf.push(0x00),
            Datum::Int(v) => {
                buf.push(0x01);
                let encoded = (*v as u64) ^ (1u64 << 63);
                buf.extend_from_slice(&encoded.to_be_bytes());
            }
            Datum::Text(s) => {
                buf.push(0x02);
                buf.extend_from_slice(s.as_bytes());
                buf.push(0x00);
            }
            Datum::Bytes(b) => {
                buf.push(0x03);
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        self.encode_to(&mut buf);
        buf
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::Text(s) => write!(f, "'{s}'"),
            Datum::Bytes(b) => write!(f, "x'{}'", hex(b)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_first() {
        assert!(Datum::Null < Datum::Int(i64::MIN));
        assert!(Datum::Int(i64::MAX) < Datum::Text(String::new()));
        assert!(Datum::Text("zzz".into()) < Datum::Bytes(vec![]));
    }

    #[test]
    fn test_int_order_preserved_in_encoding() {
        let values = [i64::MIN, -1, 0, 1, 42, i64::MAX];
        for w in values.windows(2) {
            let a = Datum::Int(w[0]).encode();
            let b = Datum::Int(w[1]).encode();
            assert!(a < b, "{} should encode below {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_text_order_preserved_in_encoding() {
        let a = Datum::Text("abc".into()).encode();
        let b = Datum::Text("abd".into()).encode();
        let c = Datum::Text("abcd".into()).encode();
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_cross_variant_encoding_order() {
        let null = Datum::Null.encode();
        let int = Datum::Int(i64::MIN).encode();
        let text = Datum::Text(String::new()).encode();
        assert!(null < int);
        assert!(int < text);
    }

    #[test]
    fn test_display() {
        assert_eq!(Datum::Int(7).to_string(), "7");
        assert_eq!(Datum::Text("v".into()).to_string(), "'v'");
        assert_eq!(Datum::Null.to_string(), "NULL");
    }
}
