use async_trait::async_trait;
use chainstream_common::{chain::BlockInfo, Cursor, Hash};
use error_stack::Result;

/// Tag selecting which chain cursor to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorTag {
    /// The most recent block.
    Head,
    /// The most recent block that can't be reorged.
    Finalized,
}

/// Chain-specific adapter used by the engine to access blocks.
///
/// Implementations are expected to be cheap to call concurrently: the
/// engine races fetches against timers and abandons the losing
/// branches, so calls must not have observable side effects.
#[async_trait]
pub trait BlockSource {
    /// The block payload delivered to consumers.
    type Block: Send + Sync + 'static;
    /// The chain-specific data filter.
    type Filter: Clone + Send + Sync + 'static;
    type Error: error_stack::Context;

    /// Returns the current cursor for the given tag.
    ///
    /// Errors if the chain has no block for the tag yet.
    async fn get_cursor(&self, tag: CursorTag) -> Result<Cursor, Self::Error>;

    /// Returns linkage information for the canonical block at the given height.
    async fn get_block_info(&self, block_number: u64) -> Result<BlockInfo, Self::Error>;

    /// Returns linkage information for the block with the given hash, if known.
    async fn get_block_info_by_hash(&self, hash: &Hash) -> Result<Option<BlockInfo>, Self::Error>;

    /// Returns linkage information for the canonical blocks in `[start_block, end_block]`.
    async fn get_block_info_range(
        &self,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<BlockInfo>, Self::Error>;

    /// Fetches the filtered content of the finalized blocks in `[start_block, end_block]`.
    ///
    /// Blocks that match none of the filters may be omitted from the result.
    async fn fetch_finalized_range(
        &self,
        start_block: u64,
        end_block: u64,
        filters: &[Self::Filter],
    ) -> Result<Vec<Self::Block>, Self::Error>;

    /// Fetches the filtered content of a single block.
    ///
    /// Returns `None` if the block matches none of the filters.
    async fn fetch_block(
        &self,
        block_number: u64,
        filters: &[Self::Filter],
    ) -> Result<Option<Self::Block>, Self::Error>;

    /// Returns true if the block with the given number and hash is canonical.
    async fn verify_block(&self, block_number: u64, hash: &Hash) -> Result<bool, Self::Error>;

    /// Validates a filter before the stream starts.
    fn validate_filter(&self, filter: &Self::Filter) -> Result<(), Self::Error>;
}
