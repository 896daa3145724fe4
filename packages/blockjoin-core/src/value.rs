//! Runtime values and collation-aware comparison.

use std::cmp::Ordering;

/// String collation.
///
/// `Binary` compares raw bytes. `CaseInsensitive` folds ASCII case and
/// ignores trailing spaces (pad-space semantics), which is what the
/// space-stripped buffer variant relies on when values round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collation {
    Binary,
    CaseInsensitive,
}

impl Collation {
    /// Compares two byte strings under this collation.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Collation::Binary => a.cmp(b),
            Collation::CaseInsensitive => {
                let a = strip_trailing_spaces(a);
                let b = strip_trailing_spaces(b);
                let mut ia = a.iter().map(|c| c.to_ascii_lowercase());
                let mut ib = b.iter().map(|c| c.to_ascii_lowercase());
                loop {
                    match (ia.next(), ib.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some(x), Some(y)) => match x.cmp(&y) {
                            Ordering::Equal => continue,
                            other => return other,
                        },
                    }
                }
            }
        }
    }

    /// Returns `true` when equality under this collation coincides with
    /// byte identity.
    pub fn binary_comparable(&self) -> bool {
        matches!(self, Collation::Binary)
    }

    /// Normalizes a byte string so that collation-equal inputs become
    /// byte-equal. Used for index key images and hashing.
    pub fn normalize(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Collation::Binary => bytes.to_vec(),
            Collation::CaseInsensitive => strip_trailing_spaces(bytes)
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        }
    }
}

fn strip_trailing_spaces(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == b' ' {
        end -= 1;
    }
    &bytes[..end]
}

/// A runtime column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn str(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL equality: `Null` never equals anything, strings compare under
    /// the given collation.
    pub fn sql_eq(&self, other: &Value, collation: Collation) -> bool {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Bytes(a), Value::Bytes(b)) => {
                collation.compare(a, b) == Ordering::Equal
            }
            _ => false,
        }
    }
}
