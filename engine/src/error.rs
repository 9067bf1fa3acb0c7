use error_stack::Report;

/// Errors raised while reconciling the canonical chain.
///
/// All variants except [ChainTrackerError::BlockFetch] are protocol
/// invariant violations and must terminate the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTrackerError {
    /// The finalized cursor moved to a lower block number.
    FinalizedMovedBackwards,
    /// The finalized cursor changed hash at the same height.
    FinalizedChangedIdentity,
    /// A block was added without its parent being tracked.
    MissingParent,
    /// Two different blocks were registered at the same height.
    AmbiguousBlock,
    /// A reorg could not be resolved above the finalized boundary.
    ReorgAcrossFinalized,
    /// The source failed to return block information.
    BlockFetch,
}

pub trait ChainTrackerErrorExt {
    /// Returns true if the error is transient and the operation can be retried.
    fn is_transient(&self) -> bool;
}

impl ChainTrackerErrorExt for Report<ChainTrackerError> {
    fn is_transient(&self) -> bool {
        matches!(self.current_context(), ChainTrackerError::BlockFetch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The stream request is invalid.
    Configuration,
    /// The engine failed to take the initial chain snapshot.
    Initialization,
    /// The canonical chain baseline could not be built.
    BuildCanonical,
    /// The chain tracker detected a protocol invariant violation.
    ChainTracker,
    /// The source failed while fetching cursors or blocks.
    BlockSource,
}

impl error_stack::Context for ChainTrackerError {}

impl std::fmt::Display for ChainTrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainTrackerError::FinalizedMovedBackwards => {
                write!(f, "chain tracker error: finalized cursor moved backwards")
            }
            ChainTrackerError::FinalizedChangedIdentity => {
                write!(f, "chain tracker error: finalized cursor changed identity")
            }
            ChainTrackerError::MissingParent => {
                write!(f, "chain tracker error: missing parent block")
            }
            ChainTrackerError::AmbiguousBlock => {
                write!(f, "chain tracker error: ambiguous block at height")
            }
            ChainTrackerError::ReorgAcrossFinalized => {
                write!(
                    f,
                    "chain tracker error: cannot reconcile reorg across the finalized boundary"
                )
            }
            ChainTrackerError::BlockFetch => {
                write!(f, "chain tracker error: failed to fetch block information")
            }
        }
    }
}

impl error_stack::Context for EngineError {}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Configuration => write!(f, "stream engine error: invalid configuration"),
            EngineError::Initialization => write!(f, "stream engine error: initialization failed"),
            EngineError::BuildCanonical => {
                write!(f, "stream engine error: failed to build canonical chain")
            }
            EngineError::ChainTracker => {
                write!(f, "stream engine error: chain tracker invariant violation")
            }
            EngineError::BlockSource => write!(f, "stream engine error: block source error"),
        }
    }
}
