use std::time::Duration;

use chainstream_common::{message::DataFinality, Cursor};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration of a single stream request.
#[derive(Debug, Clone)]
pub struct StreamConfiguration<F> {
    /// Data filters. Exactly one filter must be configured.
    pub filters: Vec<F>,
    /// The finality to deliver live data at.
    pub finality: DataFinality,
    /// Resume the stream from this cursor.
    ///
    /// The cursor is validated against the canonical chain before the
    /// first message is produced.
    pub starting_cursor: Option<Cursor>,
    /// Stop the stream once this cursor is reached.
    pub ending_cursor: Option<Cursor>,
    /// Maximum number of blocks per backfill batch.
    pub batch_size: usize,
    /// Override the engine's default heartbeat interval.
    pub heartbeat_interval: Option<Duration>,
}

/// Timing and channel options of the stream engine.
#[derive(Debug, Clone)]
pub struct StreamEngineOptions {
    /// Send a heartbeat if no data is produced for this long.
    pub heartbeat_interval: Duration,
    /// How often to re-check the finalized cursor.
    pub finalized_refresh_interval: Duration,
    /// How often to re-check the head cursor.
    pub head_refresh_interval: Duration,
    /// How long to wait before retrying a failed fetch.
    pub retry_delay: Duration,
    /// During backfill, flush an empty batch after this long to
    /// guarantee checkpoint progress.
    pub backfill_flush_interval: Duration,
    /// Size of the outgoing message channel.
    pub channel_size: usize,
}

impl<F> Default for StreamConfiguration<F> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            finality: DataFinality::default(),
            starting_cursor: None,
            ending_cursor: None,
            batch_size: DEFAULT_BATCH_SIZE,
            heartbeat_interval: None,
        }
    }
}

impl Default for StreamEngineOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            finalized_refresh_interval: Duration::from_secs(5),
            head_refresh_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            backfill_flush_interval: Duration::from_secs(5),
            channel_size: 1,
        }
    }
}
