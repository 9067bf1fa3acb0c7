//! Deterministic in-memory chain used to test the engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chainstream_common::{chain::BlockInfo, new_test_hash, Cursor, Hash};
use error_stack::{Result, ResultExt};

use crate::source::{BlockSource, CursorTag};

/// Test block payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBlock {
    pub number: u64,
    pub hash: Hash,
}

/// Test filter over block numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TestFilter {
    #[default]
    MatchAll,
    /// Matches blocks at or after the given number.
    MatchFrom(u64),
    /// Always fails validation.
    Invalid,
}

#[derive(Debug)]
pub struct TestSourceError;

/// A mock chain with a deterministic hash for every (number, fork) pair.
///
/// Cloning returns a handle to the same chain, so tests can mutate the
/// chain while the engine streams from it.
#[derive(Clone)]
pub struct TestChain(Arc<Mutex<Inner>>);

struct Inner {
    head: Option<u64>,
    finalized: Option<u64>,
    /// Fork id per height range: heights at or above the first element
    /// belong to the given fork. Later entries win.
    forks: Vec<(u64, u8)>,
    fail_fetches: u32,
    fail_lookups: u32,
}

impl TestChain {
    pub fn new(finalized: u64, head: u64) -> Self {
        assert!(finalized <= head);
        TestChain(Arc::new(Mutex::new(Inner {
            head: Some(head),
            finalized: Some(finalized),
            forks: Vec::new(),
            fail_fetches: 0,
            fail_lookups: 0,
        })))
    }

    /// A chain with no blocks at all.
    pub fn empty() -> Self {
        TestChain(Arc::new(Mutex::new(Inner {
            head: None,
            finalized: None,
            forks: Vec::new(),
            fail_fetches: 0,
            fail_lookups: 0,
        })))
    }

    pub fn head_number(&self) -> u64 {
        self.0.lock().unwrap().head.expect("chain is empty")
    }

    pub fn finalized_number(&self) -> u64 {
        self.0.lock().unwrap().finalized.expect("chain is empty")
    }

    pub fn block_info_at(&self, number: u64) -> BlockInfo {
        self.0.lock().unwrap().block_info_at(number)
    }

    pub fn block_at(&self, number: u64) -> TestBlock {
        let info = self.block_info_at(number);
        TestBlock {
            number: info.number,
            hash: info.hash,
        }
    }

    /// Extends the chain by `count` blocks on the current fork.
    pub fn append_blocks(&self, count: u64) {
        let mut inner = self.0.lock().unwrap();
        let head = inner.head.expect("chain is empty");
        inner.head = Some(head + count);
    }

    /// Truncates the chain to the given head.
    pub fn set_head(&self, head: u64) {
        let mut inner = self.0.lock().unwrap();
        inner.head = Some(head);
    }

    /// Advances the finalized block.
    pub fn advance_finalized(&self, finalized: u64) {
        let mut inner = self.0.lock().unwrap();
        assert!(finalized <= inner.head.expect("chain is empty"));
        inner.finalized = Some(finalized);
    }

    /// Replaces all blocks at or above `from` with blocks on the given
    /// fork, moving the head to `new_head`.
    pub fn apply_fork(&self, from: u64, new_head: u64, fork: u8) {
        let mut inner = self.0.lock().unwrap();
        assert!(from <= new_head);
        inner.forks.push((from, fork));
        inner.head = Some(new_head);
    }

    /// Makes the next `count` payload fetches fail.
    pub fn fail_fetches(&self, count: u32) {
        let mut inner = self.0.lock().unwrap();
        inner.fail_fetches = count;
    }

    /// Makes the next `count` by-hash lookups fail.
    pub fn fail_lookups(&self, count: u32) {
        let mut inner = self.0.lock().unwrap();
        inner.fail_lookups = count;
    }

    fn take_fetch_failure(&self) -> bool {
        let mut inner = self.0.lock().unwrap();
        if inner.fail_fetches > 0 {
            inner.fail_fetches -= 1;
            return true;
        }
        false
    }

    fn take_lookup_failure(&self) -> bool {
        let mut inner = self.0.lock().unwrap();
        if inner.fail_lookups > 0 {
            inner.fail_lookups -= 1;
            return true;
        }
        false
    }

    fn matches(filters: &[TestFilter], number: u64) -> bool {
        filters.iter().any(|filter| match filter {
            TestFilter::MatchAll => true,
            TestFilter::MatchFrom(from) => number >= *from,
            TestFilter::Invalid => false,
        })
    }
}

impl Inner {
    fn fork_at(&self, number: u64) -> u8 {
        let mut fork = 0;
        for (from, id) in self.forks.iter() {
            if number >= *from {
                fork = *id;
            }
        }
        fork
    }

    fn hash_at(&self, number: u64) -> Hash {
        new_test_hash(number, self.fork_at(number))
    }

    fn block_info_at(&self, number: u64) -> BlockInfo {
        let parent = if number == 0 {
            Hash::default()
        } else {
            self.hash_at(number - 1)
        };

        BlockInfo {
            number,
            hash: self.hash_at(number),
            parent,
        }
    }
}

#[async_trait]
impl BlockSource for TestChain {
    type Block = TestBlock;
    type Filter = TestFilter;
    type Error = TestSourceError;

    async fn get_cursor(&self, tag: CursorTag) -> Result<Cursor, Self::Error> {
        let inner = self.0.lock().unwrap();
        let number = match tag {
            CursorTag::Head => inner.head,
            CursorTag::Finalized => inner.finalized,
        };

        let number = number
            .ok_or(TestSourceError)
            .attach_printable("chain has no blocks yet")?;

        Ok(inner.block_info_at(number).cursor())
    }

    async fn get_block_info(&self, block_number: u64) -> Result<BlockInfo, Self::Error> {
        let inner = self.0.lock().unwrap();
        let head = inner.head.ok_or(TestSourceError)?;
        if block_number > head {
            return Err(TestSourceError)
                .attach_printable_lazy(|| format!("block {} not found", block_number));
        }
        Ok(inner.block_info_at(block_number))
    }

    async fn get_block_info_by_hash(&self, hash: &Hash) -> Result<Option<BlockInfo>, Self::Error> {
        if self.take_lookup_failure() {
            return Err(TestSourceError).attach_printable("injected lookup failure");
        }

        let inner = self.0.lock().unwrap();
        let Some(head) = inner.head else {
            return Ok(None);
        };

        for number in (0..=head).rev() {
            if inner.hash_at(number) == *hash {
                return Ok(Some(inner.block_info_at(number)));
            }
        }

        Ok(None)
    }

    async fn get_block_info_range(
        &self,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<BlockInfo>, Self::Error> {
        let inner = self.0.lock().unwrap();
        let head = inner.head.ok_or(TestSourceError)?;
        if end_block > head {
            return Err(TestSourceError)
                .attach_printable_lazy(|| format!("range [{start_block}, {end_block}] not found"));
        }

        Ok((start_block..=end_block)
            .map(|number| inner.block_info_at(number))
            .collect())
    }

    async fn fetch_finalized_range(
        &self,
        start_block: u64,
        end_block: u64,
        filters: &[Self::Filter],
    ) -> Result<Vec<Self::Block>, Self::Error> {
        if self.take_fetch_failure() {
            return Err(TestSourceError).attach_printable("injected fetch failure");
        }

        let inner = self.0.lock().unwrap();
        Ok((start_block..=end_block)
            .filter(|number| Self::matches(filters, *number))
            .map(|number| {
                let info = inner.block_info_at(number);
                TestBlock {
                    number: info.number,
                    hash: info.hash,
                }
            })
            .collect())
    }

    async fn fetch_block(
        &self,
        block_number: u64,
        filters: &[Self::Filter],
    ) -> Result<Option<Self::Block>, Self::Error> {
        if self.take_fetch_failure() {
            return Err(TestSourceError).attach_printable("injected fetch failure");
        }

        if !Self::matches(filters, block_number) {
            return Ok(None);
        }

        let inner = self.0.lock().unwrap();
        let info = inner.block_info_at(block_number);
        Ok(Some(TestBlock {
            number: info.number,
            hash: info.hash,
        }))
    }

    async fn verify_block(&self, block_number: u64, hash: &Hash) -> Result<bool, Self::Error> {
        let inner = self.0.lock().unwrap();
        let Some(head) = inner.head else {
            return Ok(false);
        };

        Ok(block_number <= head && inner.hash_at(block_number) == *hash)
    }

    fn validate_filter(&self, filter: &Self::Filter) -> Result<(), Self::Error> {
        if matches!(filter, TestFilter::Invalid) {
            return Err(TestSourceError).attach_printable("invalid filter");
        }
        Ok(())
    }
}

impl error_stack::Context for TestSourceError {}

impl std::fmt::Display for TestSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test source error")
    }
}
