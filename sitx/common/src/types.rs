use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal identifier associated with a destination table (engine-wide unique).
///
/// Transactions may declare the tables they intend to write; the registry uses
/// this only as a partitioning/scoping hint, never for correctness.
pub type TableId = u64;

/// Opaque cell payload stored in the versioned key-value store.
pub type CellValue = Vec<u8>;

/// Row key within the versioned store, ordered lexicographically over its bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for RowKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "RowKey({s:?})"),
            Err(_) => write!(f, "RowKey({:02x?})", self.0),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_ordering() {
        let a = RowKey::from("a");
        let b = RowKey::from("b");
        assert!(a < b);
        assert_eq!(RowKey::from("a"), RowKey::new(b"a".to_vec()));
    }

    #[test]
    fn test_row_key_debug_renders_utf8() {
        assert_eq!(format!("{:?}", RowKey::from("scott11")), "RowKey(\"scott11\")");
    }
}
