use chainstream_common::{
    chain::BlockInfo,
    message::{DataFinality, DataMessage, DataProduction, StreamMessage, SystemOutput},
    Cursor,
};
use error_stack::{Result, ResultExt};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    chain_tracker::{ChainTracker, HeadUpdate, StartingCursorValidation},
    configuration::{StreamConfiguration, StreamEngineOptions},
    error::{ChainTrackerErrorExt, EngineError},
    source::{BlockSource, CursorTag},
};

type MessageSender<B> = mpsc::Sender<StreamMessage<B>>;

/// Produces an ordered stream of data messages from a block source.
///
/// The stream goes through three phases: backfill the finalized range in
/// batches, rebuild the canonical chain between the finalized block and
/// the head, then follow the head one block at a time.
pub struct StreamEngine<S>
where
    S: BlockSource,
{
    source: S,
    configuration: StreamConfiguration<S::Filter>,
    options: StreamEngineOptions,
}

/// State of a running stream.
struct StreamRun<S>
where
    S: BlockSource,
{
    source: S,
    configuration: StreamConfiguration<S::Filter>,
    options: StreamEngineOptions,
    tracker: ChainTracker,
    /// The last cursor delivered to the consumer.
    current: Option<Cursor>,
    heartbeat_interval: std::time::Duration,
    heartbeat_deadline: Instant,
    finalized_refresh_deadline: Instant,
    head_refresh_deadline: Instant,
}

enum LiveEvent<B> {
    Refresh,
    Heartbeat,
    Block(Result<(BlockInfo, Option<B>), EngineError>),
}

impl<S> StreamEngine<S>
where
    S: BlockSource + Send + Sync + 'static,
{
    pub fn new(
        source: S,
        configuration: StreamConfiguration<S::Filter>,
        options: StreamEngineOptions,
    ) -> Self {
        Self {
            source,
            configuration,
            options,
        }
    }

    /// Starts the stream.
    ///
    /// Messages are delivered through a bounded channel, so production
    /// is paced by the consumer. The returned handle resolves when the
    /// stream ends, either because it was cancelled, the consumer went
    /// away, the ending cursor was reached, or a fatal error occurred.
    pub fn start(
        self,
        ct: CancellationToken,
    ) -> (
        ReceiverStream<StreamMessage<S::Block>>,
        JoinHandle<Result<(), EngineError>>,
    ) {
        let (tx, rx) = mpsc::channel(self.options.channel_size.max(1));
        let handle = tokio::spawn(self.run(tx, ct));
        (ReceiverStream::new(rx), handle)
    }

    async fn run(
        self,
        tx: MessageSender<S::Block>,
        ct: CancellationToken,
    ) -> Result<(), EngineError> {
        let mut run = self.initialize().await?;

        run.backfill(&tx, &ct).await?;
        if run.should_stop(&tx, &ct) {
            return Ok(());
        }

        run.build_canonical(&tx, &ct).await?;

        run.live(&tx, &ct).await
    }

    /// Validates the request and snapshots the chain.
    ///
    /// Runs before any message is produced, so configuration errors
    /// surface through the join handle with an empty stream.
    async fn initialize(self) -> Result<StreamRun<S>, EngineError> {
        let StreamEngine {
            source,
            configuration,
            options,
        } = self;

        if configuration.filters.len() != 1 {
            return Err(EngineError::Configuration)
                .attach_printable("exactly one filter must be configured")
                .attach_printable_lazy(|| format!("filters: {}", configuration.filters.len()));
        }

        source
            .validate_filter(&configuration.filters[0])
            .change_context(EngineError::Configuration)
            .attach_printable("filter validation failed")?;

        if configuration.batch_size == 0 {
            return Err(EngineError::Configuration).attach_printable("batch size must be positive");
        }

        let finalized_cursor = source
            .get_cursor(CursorTag::Finalized)
            .await
            .change_context(EngineError::Initialization)
            .attach_printable("failed to fetch the finalized cursor")?;

        let head_cursor = source
            .get_cursor(CursorTag::Head)
            .await
            .change_context(EngineError::Initialization)
            .attach_printable("failed to fetch the head cursor")?;

        if head_cursor.number < finalized_cursor.number {
            return Err(EngineError::Initialization)
                .attach_printable("head is behind the finalized block")
                .attach_printable_lazy(|| format!("head: {}", head_cursor))
                .attach_printable_lazy(|| format!("finalized: {}", finalized_cursor));
        }

        let finalized = source
            .get_block_info(finalized_cursor.number)
            .await
            .change_context(EngineError::Initialization)
            .attach_printable("failed to fetch the finalized block")?;

        let head = source
            .get_block_info(head_cursor.number)
            .await
            .change_context(EngineError::Initialization)
            .attach_printable("failed to fetch the head block")?;

        debug!(finalized = %finalized, head = %head, "starting stream");

        let mut tracker = ChainTracker::new(finalized, head, configuration.batch_size);

        let current = match &configuration.starting_cursor {
            None => None,
            Some(starting) => {
                let validation = tracker
                    .initialize_starting_cursor(starting, &source)
                    .await
                    .change_context(EngineError::Initialization)
                    .attach_printable("failed to validate the starting cursor")?;

                match validation {
                    StartingCursorValidation::Canonical { cursor } => Some(cursor),
                    StartingCursorValidation::NotCanonical { reason } => {
                        return Err(EngineError::Configuration)
                            .attach_printable("starting cursor is not canonical")
                            .attach_printable(reason)
                            .attach_printable_lazy(|| format!("cursor: {}", starting));
                    }
                }
            }
        };

        let heartbeat_interval = configuration
            .heartbeat_interval
            .unwrap_or(options.heartbeat_interval);

        let now = Instant::now();

        Ok(StreamRun {
            source,
            configuration,
            options,
            tracker,
            current,
            heartbeat_interval,
            heartbeat_deadline: now,
            finalized_refresh_deadline: now,
            head_refresh_deadline: now,
        })
    }
}

impl<S> StreamRun<S>
where
    S: BlockSource + Send + Sync + 'static,
{
    /// Streams the finalized range in batches.
    ///
    /// Batches that match no data are not delivered immediately, but a
    /// flush timer bounds how far the delivered cursor can fall behind
    /// the scanned position.
    async fn backfill(
        &mut self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut uncommitted_start = self.next_block_number();
        let mut flush_deadline = Instant::now() + self.options.backfill_flush_interval;

        debug!(finalized = %self.tracker.finalized(), "starting backfill");

        loop {
            if self.should_stop(tx, ct) {
                break;
            }

            let next = self.next_block_number();
            if next > self.tracker.finalized().number {
                break;
            }

            let mut batch_end = self
                .tracker
                .finalized()
                .number
                .min(next + self.configuration.batch_size as u64 - 1);
            if let Some(ending) = &self.configuration.ending_cursor {
                batch_end = batch_end.min(ending.number);
            }

            let blocks = match self
                .source
                .fetch_finalized_range(next, batch_end, &self.configuration.filters)
                .await
            {
                Ok(blocks) => blocks,
                Err(err) => {
                    warn!(error = ?err, "backfill batch failed");
                    let message = StreamMessage::SystemMessage {
                        output: SystemOutput::stderr(format!("backfill batch failed: {}", err)),
                    };
                    if !self.send(tx, ct, message).await {
                        return Ok(());
                    }
                    tokio::time::sleep(self.options.retry_delay).await;
                    continue;
                }
            };

            self.current = Some(Cursor::new_finalized(batch_end));

            if blocks.is_empty() && Instant::now() < flush_deadline {
                continue;
            }

            let message = StreamMessage::Data(DataMessage {
                cursor: Some(Cursor::new_finalized(uncommitted_start)),
                end_cursor: Cursor::new_finalized(batch_end),
                finality: DataFinality::Finalized,
                production: DataProduction::Backfill,
                blocks,
            });

            if !self.send(tx, ct, message).await {
                return Ok(());
            }

            uncommitted_start = batch_end + 1;
            flush_deadline = Instant::now() + self.options.backfill_flush_interval;
        }

        if ct.is_cancelled() {
            return Ok(());
        }

        // Flush the scanned-but-undelivered range so the consumer's
        // cursor lines up with the start of the next phase.
        if let Some(current) = self.current.clone() {
            if uncommitted_start <= current.number {
                let message = StreamMessage::Data(DataMessage {
                    cursor: Some(Cursor::new_finalized(uncommitted_start)),
                    end_cursor: current,
                    finality: DataFinality::Finalized,
                    production: DataProduction::Backfill,
                    blocks: Vec::new(),
                });
                self.send(tx, ct, message).await;
            }
        }

        Ok(())
    }

    /// Rebuilds the canonical chain between the finalized block and the
    /// head.
    ///
    /// Errors here are fatal: without a valid canonical chain the live
    /// phase cannot detect reorgs.
    async fn build_canonical(
        &mut self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        match self.try_build_canonical(ct).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = ?err, "failed to build the canonical chain");
                let message = StreamMessage::SystemMessage {
                    output: SystemOutput::stderr(format!(
                        "failed to build the canonical chain: {}",
                        err
                    )),
                };
                self.send(tx, ct, message).await;
                Err(err)
            }
        }
    }

    async fn try_build_canonical(&mut self, ct: &CancellationToken) -> Result<(), EngineError> {
        let finalized_cursor = self
            .source
            .get_cursor(CursorTag::Finalized)
            .await
            .change_context(EngineError::BuildCanonical)
            .attach_printable("failed to refresh the finalized cursor")?;

        let finalized = self
            .source
            .get_block_info(finalized_cursor.number)
            .await
            .change_context(EngineError::BuildCanonical)
            .attach_printable("failed to fetch the finalized block")?;

        self.tracker
            .update_finalized(finalized)
            .change_context(EngineError::BuildCanonical)?;

        let head_cursor = self
            .source
            .get_cursor(CursorTag::Head)
            .await
            .change_context(EngineError::BuildCanonical)
            .attach_printable("failed to refresh the head cursor")?;

        debug!(
            finalized = %self.tracker.finalized(),
            head = %head_cursor,
            "building canonical chain"
        );

        for number in self.tracker.finalized().number + 1..=head_cursor.number {
            if ct.is_cancelled() {
                return Ok(());
            }

            let info = self
                .source
                .get_block_info(number)
                .await
                .change_context(EngineError::BuildCanonical)
                .attach_printable_lazy(|| format!("failed to fetch block {}", number))?;

            self.tracker
                .add_to_canonical_chain(info)
                .change_context(EngineError::BuildCanonical)?;
        }

        Ok(())
    }

    /// Follows the head one block at a time.
    async fn live(
        &mut self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        let now = Instant::now();
        self.heartbeat_deadline = now + self.heartbeat_interval;
        self.finalized_refresh_deadline = now + self.options.finalized_refresh_interval;
        self.head_refresh_deadline = now + self.options.head_refresh_interval;

        debug!(head = %self.tracker.head(), "entering live mode");

        loop {
            if self.should_stop(tx, ct) {
                return Ok(());
            }

            let event = {
                let next = self.next_block_number();
                let refresh_deadline = self
                    .finalized_refresh_deadline
                    .min(self.head_refresh_deadline);

                tokio::select! {
                    biased;

                    _ = ct.cancelled() => return Ok(()),

                    _ = tokio::time::sleep_until(refresh_deadline) => LiveEvent::Refresh,

                    _ = tokio::time::sleep_until(self.heartbeat_deadline) => LiveEvent::Heartbeat,

                    result = wait_for_block(
                        &self.source,
                        next,
                        &self.configuration.filters,
                        self.options.head_refresh_interval,
                    ) => LiveEvent::Block(result),
                }
            };

            match event {
                LiveEvent::Refresh => {
                    self.refresh(tx, ct).await?;
                }
                LiveEvent::Heartbeat => {
                    debug!("sending heartbeat");
                    if !self.send(tx, ct, StreamMessage::Heartbeat).await {
                        return Ok(());
                    }
                    self.heartbeat_deadline = Instant::now() + self.heartbeat_interval;
                }
                LiveEvent::Block(Ok((info, payload))) => {
                    self.produce_block(info, payload, tx, ct).await?;
                }
                LiveEvent::Block(Err(err)) => {
                    warn!(error = ?err, "live block fetch failed");
                    let message = StreamMessage::SystemMessage {
                        output: SystemOutput::stderr(format!("live block fetch failed: {}", err)),
                    };
                    if !self.send(tx, ct, message).await {
                        return Ok(());
                    }
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        }
    }

    /// Reconciles a fetched block with the tracked chain and delivers it.
    async fn produce_block(
        &mut self,
        info: BlockInfo,
        payload: Option<S::Block>,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        // Blocks below the head were already reconciled when the head
        // moved past them. Updating the head to one of them would look
        // like the chain shrank.
        let already_tracked = self
            .tracker
            .block_info(info.number)
            .map(|tracked| tracked.hash == info.hash)
            .unwrap_or(false);

        let update = if already_tracked {
            HeadUpdate::Unchanged
        } else {
            match self.tracker.update_head(info.clone(), &self.source).await {
                Ok(update) => update,
                Err(err) if err.is_transient() => {
                    warn!(error = ?err, "failed to reconcile block");
                    let message = StreamMessage::SystemMessage {
                        output: SystemOutput::stderr(format!("failed to reconcile block: {}", err)),
                    };
                    if !self.send(tx, ct, message).await {
                        return Ok(());
                    }
                    tokio::time::sleep(self.options.retry_delay).await;
                    return Ok(());
                }
                Err(err) => {
                    return Err(err).change_context(EngineError::ChainTracker);
                }
            }
        };

        if let HeadUpdate::Reorg(ancestor) = update {
            return self.handle_reorg(ancestor, tx, ct).await;
        }

        let finality = if info.number <= self.tracker.finalized().number {
            DataFinality::Finalized
        } else {
            self.configuration.finality
        };

        let end_cursor = info.cursor();
        let message = StreamMessage::Data(DataMessage {
            cursor: Some(end_cursor.clone()),
            end_cursor: end_cursor.clone(),
            finality,
            production: DataProduction::Live,
            blocks: payload.into_iter().collect(),
        });

        if !self.send(tx, ct, message).await {
            return Ok(());
        }

        self.current = Some(end_cursor);
        self.heartbeat_deadline = Instant::now() + self.heartbeat_interval;

        Ok(())
    }

    /// Rewinds the stream to the common ancestor of a reorg.
    async fn handle_reorg(
        &mut self,
        ancestor: Cursor,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        let invalidated = self
            .current
            .as_ref()
            .map(|current| current.number > ancestor.number)
            .unwrap_or(false);

        if !invalidated {
            debug!(ancestor = %ancestor, "reorg is ahead of the stream position");
            return Ok(());
        }

        debug!(ancestor = %ancestor, "invalidating delivered data");

        let message = StreamMessage::Invalidate {
            cursor: ancestor.clone(),
        };
        if !self.send(tx, ct, message).await {
            return Ok(());
        }

        self.current = Some(ancestor);
        self.heartbeat_deadline = Instant::now() + self.heartbeat_interval;

        Ok(())
    }

    /// Runs whichever of the finalized and head refreshes are due.
    async fn refresh(
        &mut self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        let now = Instant::now();

        if now >= self.finalized_refresh_deadline {
            self.finalized_refresh_deadline = now + self.options.finalized_refresh_interval;
            self.refresh_finalized(tx, ct).await?;
        }

        if now >= self.head_refresh_deadline {
            self.head_refresh_deadline = now + self.options.head_refresh_interval;
            self.refresh_head(tx, ct).await?;
        }

        Ok(())
    }

    async fn refresh_finalized(
        &mut self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        let cursor = match self.source.get_cursor(CursorTag::Finalized).await {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!(error = ?err, "finalized refresh failed");
                let message = StreamMessage::SystemMessage {
                    output: SystemOutput::stderr(format!("finalized refresh failed: {}", err)),
                };
                self.send(tx, ct, message).await;
                return Ok(());
            }
        };

        if cursor == self.tracker.finalized() {
            return Ok(());
        }

        let info = match self.source.get_block_info(cursor.number).await {
            Ok(info) => info,
            Err(err) => {
                warn!(error = ?err, "finalized refresh failed");
                let message = StreamMessage::SystemMessage {
                    output: SystemOutput::stderr(format!("finalized refresh failed: {}", err)),
                };
                self.send(tx, ct, message).await;
                return Ok(());
            }
        };

        let advanced = self
            .tracker
            .update_finalized(info)
            .change_context(EngineError::ChainTracker)?;

        if advanced {
            debug!(finalized = %self.tracker.finalized(), "finalized block advanced");
            let message = StreamMessage::Finalize {
                cursor: self.tracker.finalized(),
            };
            if !self.send(tx, ct, message).await {
                return Ok(());
            }
        }

        Ok(())
    }

    async fn refresh_head(
        &mut self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
    ) -> Result<(), EngineError> {
        let cursor = match self.source.get_cursor(CursorTag::Head).await {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!(error = ?err, "head refresh failed");
                let message = StreamMessage::SystemMessage {
                    output: SystemOutput::stderr(format!("head refresh failed: {}", err)),
                };
                self.send(tx, ct, message).await;
                return Ok(());
            }
        };

        if cursor == self.tracker.head() {
            return Ok(());
        }

        let info = match self.source.get_block_info_by_hash(&cursor.hash).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                // The head moved again while we were looking it up.
                debug!(head = %cursor, "head block not found, skipping refresh");
                return Ok(());
            }
            Err(err) => {
                warn!(error = ?err, "head refresh failed");
                let message = StreamMessage::SystemMessage {
                    output: SystemOutput::stderr(format!("head refresh failed: {}", err)),
                };
                self.send(tx, ct, message).await;
                return Ok(());
            }
        };

        let update = match self.tracker.update_head(info, &self.source).await {
            Ok(update) => update,
            Err(err) if err.is_transient() => {
                warn!(error = ?err, "head refresh failed");
                let message = StreamMessage::SystemMessage {
                    output: SystemOutput::stderr(format!("head refresh failed: {}", err)),
                };
                self.send(tx, ct, message).await;
                return Ok(());
            }
            Err(err) => {
                return Err(err).change_context(EngineError::ChainTracker);
            }
        };

        match update {
            HeadUpdate::Unchanged => Ok(()),
            HeadUpdate::NewHead(head) => {
                debug!(head = %head, "head advanced");
                Ok(())
            }
            HeadUpdate::Reorg(ancestor) => self.handle_reorg(ancestor, tx, ct).await,
        }
    }

    /// Sends a message, pacing production on the consumer.
    ///
    /// Returns false if the stream was cancelled or the consumer went
    /// away.
    async fn send(
        &self,
        tx: &MessageSender<S::Block>,
        ct: &CancellationToken,
        message: StreamMessage<S::Block>,
    ) -> bool {
        let Some(reserved) = ct.run_until_cancelled(tx.reserve()).await else {
            return false;
        };

        let Ok(permit) = reserved else {
            debug!("consumer went away");
            return false;
        };

        permit.send(message);
        true
    }

    fn next_block_number(&self) -> u64 {
        self.current
            .as_ref()
            .map(|cursor| cursor.number + 1)
            .unwrap_or(0)
    }

    fn should_stop(&self, tx: &MessageSender<S::Block>, ct: &CancellationToken) -> bool {
        if ct.is_cancelled() || tx.is_closed() {
            return true;
        }

        match (&self.current, &self.configuration.ending_cursor) {
            (Some(current), Some(ending)) => current.number >= ending.number,
            _ => false,
        }
    }
}

/// Waits for the chain to reach the given height, then fetches the
/// block's linkage and payload concurrently.
async fn wait_for_block<S>(
    source: &S,
    block_number: u64,
    filters: &[S::Filter],
    poll_interval: std::time::Duration,
) -> Result<(BlockInfo, Option<S::Block>), EngineError>
where
    S: BlockSource + Sync,
{
    loop {
        let head = source
            .get_cursor(CursorTag::Head)
            .await
            .change_context(EngineError::BlockSource)
            .attach_printable("failed to fetch the head cursor")?;

        if head.number >= block_number {
            break;
        }

        tokio::time::sleep(poll_interval).await;
    }

    let (info, payload) = tokio::join!(
        source.get_block_info(block_number),
        source.fetch_block(block_number, filters),
    );

    let info = info
        .change_context(EngineError::BlockSource)
        .attach_printable_lazy(|| format!("failed to fetch info for block {}", block_number))?;

    let payload = payload
        .change_context(EngineError::BlockSource)
        .attach_printable_lazy(|| format!("failed to fetch block {}", block_number))?;

    Ok((info, payload))
}
