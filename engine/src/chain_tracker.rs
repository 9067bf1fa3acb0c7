use std::collections::BTreeMap;

use chainstream_common::{chain::BlockInfo, Cursor};
use error_stack::{Result, ResultExt};
use tracing::debug;

use crate::{error::ChainTrackerError, source::BlockSource};

/// Outcome of a head update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadUpdate {
    /// The new head is the same as the current head.
    Unchanged,
    /// The chain grew to the given head.
    NewHead(Cursor),
    /// The chain reorganized. The cursor is the common ancestor between
    /// the old and new canonical chain.
    Reorg(Cursor),
}

/// Outcome of validating a starting cursor against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartingCursorValidation {
    /// The cursor belongs to the canonical chain.
    Canonical { cursor: Cursor },
    /// The cursor does not belong to the canonical chain.
    NotCanonical { reason: String },
}

/// In-memory model of the canonical chain between the finalized
/// boundary and the head.
///
/// The chain is stored as a map keyed by height. For every tracked
/// height above the finalized boundary, the entry's parent hash matches
/// the entry at the previous height. Entries below the finalized
/// boundary are pruned to bound memory.
pub struct ChainTracker {
    finalized: BlockInfo,
    head: BlockInfo,
    canonical: BTreeMap<u64, BlockInfo>,
    batch_size: usize,
}

impl ChainTracker {
    pub fn new(finalized: BlockInfo, head: BlockInfo, batch_size: usize) -> Self {
        let mut canonical = BTreeMap::new();
        canonical.insert(finalized.number, finalized.clone());

        Self {
            finalized,
            head,
            canonical,
            batch_size,
        }
    }

    pub fn head(&self) -> Cursor {
        self.head.cursor()
    }

    pub fn finalized(&self) -> Cursor {
        self.finalized.cursor()
    }

    /// Returns the tracked block at the given height, if any.
    pub fn block_info(&self, block_number: u64) -> Option<&BlockInfo> {
        self.canonical.get(&block_number)
    }

    /// Advances the finalized pointer, pruning entries below it.
    ///
    /// Returns true if the finalized height actually advanced.
    pub fn update_finalized(&mut self, new_finalized: BlockInfo) -> Result<bool, ChainTrackerError> {
        if new_finalized.number < self.finalized.number {
            return Err(ChainTrackerError::FinalizedMovedBackwards)
                .attach_printable_lazy(|| format!("current finalized: {}", self.finalized))
                .attach_printable_lazy(|| format!("new finalized: {}", new_finalized));
        }

        if new_finalized.number == self.finalized.number {
            if new_finalized.hash != self.finalized.hash {
                return Err(ChainTrackerError::FinalizedChangedIdentity)
                    .attach_printable_lazy(|| format!("current finalized: {}", self.finalized))
                    .attach_printable_lazy(|| format!("new finalized: {}", new_finalized));
            }
            return Ok(false);
        }

        self.canonical
            .retain(|number, _| *number >= new_finalized.number);
        self.canonical
            .insert(new_finalized.number, new_finalized.clone());

        if self.head.number < new_finalized.number {
            self.head = new_finalized.clone();
        }

        self.finalized = new_finalized;

        Ok(true)
    }

    /// Appends one contiguous block to the canonical chain.
    pub fn add_to_canonical_chain(&mut self, block_info: BlockInfo) -> Result<(), ChainTrackerError> {
        if let Some(existing) = self.canonical.get(&block_info.number) {
            if existing.hash != block_info.hash {
                return Err(ChainTrackerError::AmbiguousBlock)
                    .attach_printable_lazy(|| format!("existing block: {}", existing))
                    .attach_printable_lazy(|| format!("new block: {}", block_info));
            }
            return Ok(());
        }

        let parent_number = block_info
            .number
            .checked_sub(1)
            .ok_or(ChainTrackerError::MissingParent)
            .attach_printable("genesis block has no parent")?;

        let parent = self
            .canonical
            .get(&parent_number)
            .ok_or(ChainTrackerError::MissingParent)
            .attach_printable_lazy(|| format!("block: {}", block_info))?;

        if parent.hash != block_info.parent {
            return Err(ChainTrackerError::MissingParent)
                .attach_printable("parent hash does not match the tracked block")
                .attach_printable_lazy(|| format!("tracked parent: {}", parent))
                .attach_printable_lazy(|| format!("block: {}", block_info));
        }

        if block_info.number > self.head.number {
            self.head = block_info.clone();
        }

        self.canonical.insert(block_info.number, block_info);

        Ok(())
    }

    /// Reconciles the tracked chain with a new head.
    pub async fn update_head<S>(
        &mut self,
        new_head: BlockInfo,
        source: &S,
    ) -> Result<HeadUpdate, ChainTrackerError>
    where
        S: BlockSource + Sync,
    {
        if new_head.number == self.head.number && new_head.hash == self.head.hash {
            return Ok(HeadUpdate::Unchanged);
        }

        // The chain shrank to a block that is already tracked. The
        // finalized block itself is a valid shrink target.
        if new_head.number <= self.head.number {
            if let Some(existing) = self.canonical.get(&new_head.number) {
                if existing.hash == new_head.hash {
                    self.canonical.split_off(&(new_head.number + 1));
                    self.head = new_head;
                    return Ok(HeadUpdate::Reorg(self.head.cursor()));
                }
            }
        }

        if new_head.number <= self.finalized.number {
            return Err(ChainTrackerError::ReorgAcrossFinalized)
                .attach_printable("new head is at or below the finalized boundary")
                .attach_printable_lazy(|| format!("finalized: {}", self.finalized))
                .attach_printable_lazy(|| format!("new head: {}", new_head));
        }

        // Simple growth.
        if self.head.is_parent_of(&new_head) {
            let cursor = new_head.cursor();
            self.canonical.insert(new_head.number, new_head.clone());
            self.head = new_head;
            return Ok(HeadUpdate::NewHead(cursor));
        }

        // Batched growth. Fetch the missing range and validate its
        // linkage before appending anything.
        if new_head.number > self.head.number + 1 {
            if self.fill_missing_range(&new_head, source).await? {
                let cursor = new_head.cursor();
                self.canonical.insert(new_head.number, new_head.clone());
                self.head = new_head;
                return Ok(HeadUpdate::NewHead(cursor));
            }

            debug!(new_head = %new_head, "missed a reorg while the head grew");
            return self.resolve_reorg(new_head, source).await;
        }

        self.resolve_reorg(new_head, source).await
    }

    /// Optimistic check that a cursor belongs to the tracked chain.
    ///
    /// Advisory only: cursors without a hash and cursors at untracked
    /// heights are assumed canonical.
    pub fn is_canonical(&self, cursor: &Cursor) -> bool {
        if cursor.hash.is_empty() {
            return true;
        }

        match self.canonical.get(&cursor.number) {
            None => true,
            Some(entry) => entry.hash == cursor.hash,
        }
    }

    /// Validates a stream resume point before trusting it.
    ///
    /// On success, returns the cursor completed with its canonical hash
    /// and registers the block in the tracked chain.
    pub async fn initialize_starting_cursor<S>(
        &mut self,
        cursor: &Cursor,
        source: &S,
    ) -> Result<StartingCursorValidation, ChainTrackerError>
    where
        S: BlockSource + Sync,
    {
        if cursor.number > self.head.number {
            return Ok(StartingCursorValidation::NotCanonical {
                reason: format!(
                    "cursor is ahead of the chain head ({} > {})",
                    cursor.number, self.head.number
                ),
            });
        }

        if !cursor.hash.is_empty() {
            let verified = source
                .verify_block(cursor.number, &cursor.hash)
                .await
                .change_context(ChainTrackerError::BlockFetch)
                .attach_printable("failed to verify starting block")?;

            if !verified {
                return Ok(StartingCursorValidation::NotCanonical {
                    reason: format!("block {} is not part of the canonical chain", cursor),
                });
            }
        }

        let block_info = source
            .get_block_info(cursor.number)
            .await
            .change_context(ChainTrackerError::BlockFetch)
            .attach_printable("failed to fetch starting block info")?;

        if !cursor.hash.is_empty() && block_info.hash != cursor.hash {
            return Ok(StartingCursorValidation::NotCanonical {
                reason: format!(
                    "block hash changed while validating the starting cursor ({})",
                    cursor
                ),
            });
        }

        let full_cursor = block_info.cursor();

        if block_info.number > self.finalized.number {
            self.canonical.insert(block_info.number, block_info);
        }

        Ok(StartingCursorValidation::Canonical {
            cursor: full_cursor,
        })
    }

    /// Fetches and validates the blocks between the current head and
    /// `new_head`, exclusive.
    ///
    /// Returns false without modifying the chain if the fetched range
    /// does not link the current head to the new head.
    async fn fill_missing_range<S>(
        &mut self,
        new_head: &BlockInfo,
        source: &S,
    ) -> Result<bool, ChainTrackerError>
    where
        S: BlockSource + Sync,
    {
        let start = self.head.number + 1;
        let end = new_head.number - 1;

        let mut fetched = Vec::with_capacity((end + 1 - start) as usize);
        let mut batch_start = start;
        while batch_start <= end {
            let batch_end = end.min(batch_start + self.batch_size as u64 - 1);
            let blocks = source
                .get_block_info_range(batch_start, batch_end)
                .await
                .change_context(ChainTrackerError::BlockFetch)
                .attach_printable("failed to fetch missing block range")
                .attach_printable_lazy(|| format!("range: [{}, {}]", batch_start, batch_end))?;
            fetched.extend(blocks);
            batch_start = batch_end + 1;
        }

        let mut previous = &self.head;
        for block in fetched.iter() {
            if !previous.is_parent_of(block) {
                return Ok(false);
            }
            previous = block;
        }

        if !previous.is_parent_of(new_head) {
            return Ok(false);
        }

        for block in fetched {
            self.canonical.insert(block.number, block);
        }

        Ok(true)
    }

    /// Walks the new chain backwards until it reconnects with the
    /// tracked chain, then replaces the rewritten section.
    ///
    /// The tracked chain is only mutated once the common ancestor is
    /// found, so a failed walk leaves it intact for the retry.
    async fn resolve_reorg<S>(
        &mut self,
        new_head: BlockInfo,
        source: &S,
    ) -> Result<HeadUpdate, ChainTrackerError>
    where
        S: BlockSource + Sync,
    {
        let mut new_chain = Vec::new();
        let mut current = new_head.clone();

        let ancestor = loop {
            let parent_number = current.number - 1;

            if let Some(entry) = self.canonical.get(&parent_number) {
                if entry.hash == current.parent {
                    break entry.cursor();
                }
            }

            // Reorg targets below the finalized boundary are never
            // considered: finality was violated upstream.
            if parent_number <= self.finalized.number {
                return Err(ChainTrackerError::ReorgAcrossFinalized)
                    .attach_printable_lazy(|| format!("finalized: {}", self.finalized))
                    .attach_printable_lazy(|| format!("new head: {}", new_head));
            }

            let parent = source
                .get_block_info_by_hash(&current.parent)
                .await
                .change_context(ChainTrackerError::BlockFetch)
                .attach_printable("failed to fetch ancestor of the new chain")?
                .ok_or(ChainTrackerError::BlockFetch)
                .attach_printable("ancestor of the new chain not found")
                .attach_printable_lazy(|| format!("hash: {}", current.parent))?;

            new_chain.push(current);
            current = parent;
        };

        new_chain.push(current);

        // Entries above the new head are invalid no matter where the
        // chains reconnect.
        self.canonical.split_off(&(new_head.number + 1));

        for block in new_chain {
            self.canonical.insert(block.number, block);
        }

        debug!(ancestor = %ancestor, new_head = %new_head, "reorg resolved");

        self.head = new_head;

        Ok(HeadUpdate::Reorg(ancestor))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chainstream_common::new_test_cursor;

    use crate::testing::TestChain;

    use super::{ChainTracker, HeadUpdate, StartingCursorValidation};

    const BATCH_SIZE: usize = 10;

    fn new_tracker(chain: &TestChain) -> ChainTracker {
        let finalized = chain.block_info_at(chain.finalized_number());
        let head = chain.block_info_at(chain.head_number());
        ChainTracker::new(finalized, head, BATCH_SIZE)
    }

    fn fill_canonical(tracker: &mut ChainTracker, chain: &TestChain) {
        for number in chain.finalized_number() + 1..=chain.head_number() {
            tracker
                .add_to_canonical_chain(chain.block_info_at(number))
                .unwrap();
        }
    }

    #[test]
    fn test_update_finalized_advances_and_prunes() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        let advanced = tracker
            .update_finalized(chain.block_info_at(105))
            .unwrap();

        assert!(advanced);
        assert_eq!(tracker.finalized(), new_test_cursor(105, 0));
        assert!(tracker.block_info(104).is_none());
        assert!(tracker.block_info(105).is_some());

        // Same height, same hash: no-op.
        let advanced = tracker
            .update_finalized(chain.block_info_at(105))
            .unwrap();
        assert!(!advanced);
    }

    #[test]
    fn test_update_finalized_moving_backwards_is_fatal() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        let result = tracker.update_finalized(chain.block_info_at(99));
        assert!(result.is_err());
    }

    #[test]
    fn test_update_finalized_changing_identity_is_fatal() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        let mut other = chain.block_info_at(100);
        other.hash = new_test_cursor(100, 1).hash;

        let result = tracker.update_finalized(other);
        assert!(result.is_err());
    }

    #[test]
    fn test_add_to_canonical_chain_requires_parent() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        // Block 102's parent (101) is not tracked yet.
        let result = tracker.add_to_canonical_chain(chain.block_info_at(102));
        assert!(result.is_err());

        tracker
            .add_to_canonical_chain(chain.block_info_at(101))
            .unwrap();
        tracker
            .add_to_canonical_chain(chain.block_info_at(102))
            .unwrap();

        // Re-adding the same block is fine.
        tracker
            .add_to_canonical_chain(chain.block_info_at(102))
            .unwrap();

        // A different block at a tracked height is not.
        let mut other = chain.block_info_at(102);
        other.hash = new_test_cursor(102, 7).hash;
        assert!(tracker.add_to_canonical_chain(other).is_err());
    }

    #[tokio::test]
    async fn test_update_head_unchanged() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        let update = tracker
            .update_head(chain.block_info_at(110), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::Unchanged);
    }

    #[tokio::test]
    async fn test_update_head_simple_growth() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        chain.append_blocks(1);

        let update = tracker
            .update_head(chain.block_info_at(111), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::NewHead(new_test_cursor(111, 0)));
        assert_eq!(tracker.head(), new_test_cursor(111, 0));
        assert!(tracker.block_info(111).is_some());
    }

    #[tokio::test]
    async fn test_update_head_batched_growth() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        // Jump by more than one batch.
        chain.append_blocks(25);

        let update = tracker
            .update_head(chain.block_info_at(135), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::NewHead(new_test_cursor(135, 0)));
        for number in 111..=135 {
            assert_eq!(
                tracker.block_info(number).unwrap().cursor(),
                new_test_cursor(number, 0)
            );
        }
    }

    #[tokio::test]
    async fn test_update_head_batched_growth_with_interleaved_reorg() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        // The chain reorged at 108 and then grew past the old head.
        chain.apply_fork(108, 120, 1);

        let update = tracker
            .update_head(chain.block_info_at(120), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::Reorg(new_test_cursor(107, 0)));
        assert_eq!(tracker.head(), new_test_cursor(120, 1));
        for number in 108..=120 {
            assert_eq!(
                tracker.block_info(number).unwrap().cursor(),
                new_test_cursor(number, 1)
            );
        }
    }

    #[tokio::test]
    async fn test_update_head_shrink_to_tracked_block() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        chain.set_head(105);

        let update = tracker
            .update_head(chain.block_info_at(105), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::Reorg(new_test_cursor(105, 0)));
        assert_eq!(tracker.head(), new_test_cursor(105, 0));
        assert!(tracker.block_info(106).is_none());
    }

    #[tokio::test]
    async fn test_update_head_shrink_to_finalized_block() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        chain.set_head(100);

        let update = tracker
            .update_head(chain.block_info_at(100), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::Reorg(new_test_cursor(100, 0)));
        assert_eq!(tracker.head(), new_test_cursor(100, 0));
        assert_eq!(tracker.finalized(), new_test_cursor(100, 0));
        assert!(tracker.block_info(101).is_none());
    }

    #[tokio::test]
    async fn test_update_head_rewrite() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        chain.apply_fork(105, 109, 1);

        let update = tracker
            .update_head(chain.block_info_at(109), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::Reorg(new_test_cursor(104, 0)));
        assert_eq!(tracker.head(), new_test_cursor(109, 1));
        assert!(tracker.block_info(110).is_none());
        for number in 105..=109 {
            assert_eq!(
                tracker.block_info(number).unwrap().cursor(),
                new_test_cursor(number, 1)
            );
        }
        assert_eq!(
            tracker.block_info(104).unwrap().cursor(),
            new_test_cursor(104, 0)
        );
    }

    #[tokio::test]
    async fn test_update_head_rewrite_retries_after_lookup_error() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        chain.apply_fork(105, 109, 1);
        chain.fail_lookups(1);

        let result = tracker.update_head(chain.block_info_at(109), &chain).await;
        assert!(result.is_err());

        // The failed walk leaves the tracked chain untouched.
        assert_eq!(tracker.head(), new_test_cursor(110, 0));
        assert!(tracker.block_info(110).is_some());

        let update = tracker
            .update_head(chain.block_info_at(109), &chain)
            .await
            .unwrap();

        assert_eq!(update, HeadUpdate::Reorg(new_test_cursor(104, 0)));
        assert_eq!(tracker.head(), new_test_cursor(109, 1));
    }

    #[tokio::test]
    async fn test_update_head_reorg_across_finalized_is_fatal() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        // Fork all the way down to the finalized block.
        chain.apply_fork(100, 109, 1);

        let result = tracker.update_head(chain.block_info_at(109), &chain).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_is_canonical() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);
        fill_canonical(&mut tracker, &chain);

        assert!(tracker.is_canonical(&new_test_cursor(105, 0)));
        assert!(!tracker.is_canonical(&new_test_cursor(105, 1)));
        // No hash: optimistic.
        assert!(tracker.is_canonical(&chainstream_common::Cursor::new_finalized(105)));
        // Untracked height: optimistic.
        assert!(tracker.is_canonical(&new_test_cursor(500, 0)));
    }

    #[tokio::test]
    async fn test_initialize_starting_cursor_without_hash() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        let validation = tracker
            .initialize_starting_cursor(&chainstream_common::Cursor::new_finalized(105), &chain)
            .await
            .unwrap();

        assert_eq!(
            validation,
            StartingCursorValidation::Canonical {
                cursor: new_test_cursor(105, 0)
            }
        );
        assert!(tracker.block_info(105).is_some());
    }

    #[tokio::test]
    async fn test_initialize_starting_cursor_with_valid_hash() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        let validation = tracker
            .initialize_starting_cursor(&new_test_cursor(105, 0), &chain)
            .await
            .unwrap();

        assert_matches!(validation, StartingCursorValidation::Canonical { .. });
    }

    #[tokio::test]
    async fn test_initialize_starting_cursor_with_invalid_hash() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        let validation = tracker
            .initialize_starting_cursor(&new_test_cursor(105, 1), &chain)
            .await
            .unwrap();

        assert_matches!(validation, StartingCursorValidation::NotCanonical { .. });
    }

    #[tokio::test]
    async fn test_initialize_starting_cursor_ahead_of_head() {
        let chain = TestChain::new(100, 110);
        let mut tracker = new_tracker(&chain);

        let validation = tracker
            .initialize_starting_cursor(&new_test_cursor(111, 0), &chain)
            .await
            .unwrap();

        assert_matches!(validation, StartingCursorValidation::NotCanonical { .. });
    }
}
