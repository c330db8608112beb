use std::fmt;

/// Opaque public key, compared byte-for-byte.
///
/// Ordering is lexicographic over the raw bytes, matching the Go
/// implementation's string comparison of base64-ish key material: the peer
/// whose key compares greater is the "controller" (spec.md §4.7, §9).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerKey(Vec<u8>);

impl PeerKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<Vec<u8>> for PeerKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// An optional WireGuard pre-shared key.
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey(Vec<u8>);

impl PresharedKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic_over_bytes() {
        let a = PeerKey::new(vec![1, 2, 3]);
        let b = PeerKey::new(vec![1, 2, 4]);
        assert!(a < b);

        let short = PeerKey::new(vec![1, 2]);
        let long = PeerKey::new(vec![1, 2, 0]);
        assert!(short < long);
    }
}
