use crate::Cursor;

/// Finality status of a block.
///
/// For a fixed block identity the status only ever strengthens over
/// time, moving towards [DataFinality::Finalized].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataFinality {
    /// The block can't be part of a reorg anymore.
    Finalized,
    /// The block is part of the canonical chain but may still be reorged.
    #[default]
    Accepted,
    /// The block has not been accepted into the canonical chain yet.
    Pending,
    Unknown,
}

/// How the data in a message was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataProduction {
    /// Historical batch of already-finalized data.
    Backfill,
    /// Tip-following data.
    Live,
}

/// Out-of-band output from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemOutput {
    Stdout(String),
    Stderr(String),
}

/// A batch of blocks together with the stream position it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage<B> {
    /// Cursor of the first block covered by the batch.
    pub cursor: Option<Cursor>,
    /// Cursor of the last block covered by the batch.
    ///
    /// Consumers should checkpoint this cursor.
    pub end_cursor: Cursor,
    pub finality: DataFinality,
    pub production: DataProduction,
    pub blocks: Vec<B>,
}

/// A message produced by the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage<B> {
    /// A batch of data.
    Data(DataMessage<B>),
    /// Previously-delivered blocks after the given cursor are no longer canonical.
    Invalidate { cursor: Cursor },
    /// All blocks up to and including the given cursor are now finalized.
    Finalize { cursor: Cursor },
    /// Liveness signal, sent when no data has been produced for a while.
    Heartbeat,
    /// Advisory message. Never terminates the stream.
    SystemMessage { output: SystemOutput },
}

impl<B> StreamMessage<B> {
    pub fn as_data(&self) -> Option<&DataMessage<B>> {
        match self {
            StreamMessage::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_invalidate(&self) -> Option<&Cursor> {
        match self {
            StreamMessage::Invalidate { cursor } => Some(cursor),
            _ => None,
        }
    }

    pub fn as_finalize(&self) -> Option<&Cursor> {
        match self {
            StreamMessage::Finalize { cursor } => Some(cursor),
            _ => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, StreamMessage::Heartbeat)
    }

    pub fn as_system_message(&self) -> Option<&SystemOutput> {
        match self {
            StreamMessage::SystemMessage { output } => Some(output),
            _ => None,
        }
    }
}

impl SystemOutput {
    pub fn stderr(message: impl Into<String>) -> Self {
        SystemOutput::Stderr(message.into())
    }

    pub fn stdout(message: impl Into<String>) -> Self {
        SystemOutput::Stdout(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::DataFinality;

    #[test]
    fn test_finality_ordering() {
        assert!(DataFinality::Finalized < DataFinality::Accepted);
        assert!(DataFinality::Accepted < DataFinality::Pending);
        assert!(DataFinality::Pending < DataFinality::Unknown);
    }
}
