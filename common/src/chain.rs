use crate::{Cursor, Hash};

/// Linkage information about a single block in the chain.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: Hash,
    pub parent: Hash,
}

impl BlockInfo {
    pub fn cursor(&self) -> Cursor {
        Cursor {
            number: self.number,
            hash: self.hash.clone(),
        }
    }

    /// Returns true if `child` extends this block.
    pub fn is_parent_of(&self, child: &BlockInfo) -> bool {
        child.number == self.number + 1 && child.parent == self.hash
    }
}

impl std::fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockInfo(n={} h={} p={})",
            self.number,
            self.hash.as_hex(),
            self.parent.as_hex()
        )
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.hash.as_hex())
    }
}
