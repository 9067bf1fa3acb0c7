/// A block hash.
///
/// An empty hash means "no hash": cursors with an empty hash identify a
/// block only by its height.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub Vec<u8>);

/// Cursor uniquely identifies a block by its number and hash.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub number: u64,
    pub hash: Hash,
}

impl Hash {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_hex(&self) -> String {
        if self.0.is_empty() {
            return "0x0".to_string();
        }
        format!("0x{}", hex::encode(&self.0))
    }
}

impl Cursor {
    pub fn new(number: u64, hash: Hash) -> Self {
        Self { number, hash }
    }

    /// Creates a cursor without a hash.
    ///
    /// Finalized blocks are identified by their number only since they
    /// can't be part of a reorg.
    pub fn new_finalized(number: u64) -> Self {
        Self {
            number,
            hash: Hash::default(),
        }
    }

    pub fn hash_as_hex(&self) -> String {
        self.hash.as_hex()
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl From<Vec<u8>> for Hash {
    fn from(value: Vec<u8>) -> Self {
        Hash(value)
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cursor(n={} h={})", self.number, self.hash_as_hex())
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.hash_as_hex())
    }
}

pub mod testing {
    use super::{Cursor, Hash};

    /// Returns a new test hash that depends on the block number and fork.
    pub fn new_test_hash(number: u64, fork: u8) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[0] = fork;
        bytes[24..].copy_from_slice(&number.to_be_bytes());
        Hash(bytes.to_vec())
    }

    /// Returns a new test cursor where the hash depends on the cursor number and fork.
    pub fn new_test_cursor(number: u64, fork: u8) -> Cursor {
        Cursor {
            number,
            hash: new_test_hash(number, fork),
        }
    }
}
