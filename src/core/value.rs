use crate::core::constants::KEY_NOT_FOUND;
use std::cmp::Ordering;
use std::fmt;

/// Owned byte string used for B-tree keys and record payloads.
///
/// Ordering is unsigned lexicographic, a proper prefix sorts first. A value
/// read from the record store also carries the storage address it came from.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Value {
    data: Vec<u8>,
    address: u64,
}

impl Value {
    pub const EMPTY: Value = Value {
        data: Vec::new(),
        address: KEY_NOT_FOUND,
    };

    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            address: KEY_NOT_FOUND,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    pub fn with_address(data: Vec<u8>, address: u64) -> Self {
        Self { data, address }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    /// Length of the common leading byte run shared with `other`.
    pub fn common_prefix(&self, other: &Value) -> usize {
        common_prefix(&self.data, &other.data)
    }

    /// Compares only the leading `prefix.len()` bytes of this value against
    /// `prefix`. A value shorter than the prefix that matches as far as it
    /// goes sorts before it.
    pub fn compare_prefix(&self, prefix: &Value) -> Ordering {
        let n = self.data.len().min(prefix.data.len());
        match self.data[..n].cmp(&prefix.data[..n]) {
            Ordering::Equal if self.data.len() < prefix.data.len() => Ordering::Less,
            other => other,
        }
    }

    pub fn starts_with(&self, prefix: &Value) -> bool {
        self.data.starts_with(&prefix.data)
    }

    /// Value with the first `n` bytes removed.
    pub fn strip_prefix(&self, n: usize) -> Value {
        Value::new(self.data[n.min(self.data.len())..].to_vec())
    }

    /// Leading `n` bytes.
    pub fn head(&self, n: usize) -> Value {
        Value::new(self.data[..n.min(self.data.len())].to_vec())
    }

    pub fn concat(&self, other: &Value) -> Value {
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Value::new(data)
    }
}

pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data.cmp(&other.data)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::new(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::from_slice(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::new(b)
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.data) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "Value({:?})", s),
            _ => write!(f, "Value({:02x?})", self.data),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_unsigned_lexicographic() {
        let a = Value::from("abc");
        let b = Value::from("abd");
        let short = Value::from("ab");
        let high = Value::from_slice(&[0xFF]);

        assert!(a < b);
        assert!(short < a);
        assert!(a < high);
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(Value::from("index").common_prefix(&Value::from("indent")), 4);
        assert_eq!(Value::from("x").common_prefix(&Value::from("y")), 0);
        assert_eq!(Value::EMPTY.common_prefix(&Value::from("y")), 0);
    }

    #[test]
    fn test_compare_prefix() {
        let prefix = Value::from("doc");
        assert_eq!(Value::from("document").compare_prefix(&prefix), Ordering::Equal);
        assert_eq!(Value::from("do").compare_prefix(&prefix), Ordering::Less);
        assert_eq!(Value::from("dog").compare_prefix(&prefix), Ordering::Greater);
        assert_eq!(Value::from("abc").compare_prefix(&prefix), Ordering::Less);
    }

    #[test]
    fn test_strip_and_concat() {
        let v = Value::from("prefix-key");
        let stripped = v.strip_prefix(7);
        assert_eq!(stripped.as_bytes(), b"key");
        assert_eq!(v.head(6).concat(&Value::from("-x")).as_bytes(), b"prefix-x");
        assert!(v.strip_prefix(99).is_empty());
    }
}
