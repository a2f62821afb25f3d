//! Chunked is the ferry module that drives one candidate source
//! end-to-end.
//!
//! It consists of multiple parts:
//! - A driver task that works through the source descriptors known for
//!   the content, one attempt per descriptor
//! - A per-attempt protocol loop that issues a bounded number of
//!   concurrent chunk requests, reassembles out-of-order responses, and
//!   writes the destination strictly in offset order
//! - A periodic health check, injected into the protocol loop as a
//!   ticking branch of the same `select!`, that re-arms timed-out slots
//!   and detects stalls
//! - A locator task that polls the source locator for new descriptors
//!   while discovery is enabled
//!
//! ### Slots
//!
//! A fixed arena of request slots bounds transfer concurrency. Each slot
//! owns one byte range at a time; its index doubles as the wire
//! correlation id. A slot is only reused once its bytes have been
//! durably written to the destination in order, enforced by the single
//! monotonically increasing write cursor.
//!
//! ### Failure policy
//!
//! Malformed responses are logged and dropped; the slot's own response
//! timeout drives the resend. A send failure marks the slot for resend
//! on the next health check instead of failing the transfer. Only
//! exhaustion of every known descriptor ends the transfer, and it ends
//! it stalled, not failed, so an owning aggregate can promote another
//! candidate.

use ferry_api::{
    builder, config::Config, content::*, pipe::*, protocol::*, transfer::*,
    *,
};
use message_handler::ChunkedMessageHandler;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{
    channel, unbounded_channel, Receiver, UnboundedReceiver, UnboundedSender,
};

mod message_handler;


/// The module name chunk requests are addressed to on a serving peer.
pub const CHUNK_REQ_MOD_NAME: &str = "ChunkReq";

/// Prefix for the per-attempt response inbox module names.
const CHUNK_RESP_MOD_PREFIX: &str = "ChunkResp/";

/// CoreChunked configuration types.
pub mod config {
    /// Configuration parameters for
    /// [ChunkedProviderFactory](super::ChunkedProviderFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct CoreChunkedConfig {
        /// How many chunk requests may be outstanding at once.
        /// Default: 3.
        pub max_outstanding_requests: u32,

        /// Maximum bytes requested per chunk. Default: 50000.
        pub max_request_bytes: u32,

        /// Interval of the periodic slot health check in milliseconds.
        /// Default: 5000.
        pub health_check_interval_ms: u32,

        /// How long a slot waits for its response before resending, in
        /// milliseconds. Default: 10000.
        pub response_timeout_ms: u32,

        /// How long the attempt tolerates zero byte progress before
        /// aborting stalled, in milliseconds. Default: 30000.
        pub stall_timeout_ms: u32,

        /// Interval at which the source locator is polled while
        /// discovery is enabled, in milliseconds. Default: 1000.
        pub locate_interval_ms: u32,

        /// Source count at which a standby transfer may stop
        /// discovering. Default: 2.
        pub enough_source_count: u32,

        /// Source count at which the active transfer may stop
        /// discovering. Default: 5.
        pub many_source_count: u32,
    }

    impl Default for CoreChunkedConfig {
        fn default() -> Self {
            Self {
                max_outstanding_requests: 3,
                max_request_bytes: 50_000,
                health_check_interval_ms: 5_000,
                response_timeout_ms: 10_000,
                stall_timeout_ms: 30_000,
                locate_interval_ms: 1_000,
                enough_source_count: 2,
                many_source_count: 5,
            }
        }
    }

    /// Module-level configuration for CoreChunked.
    #[derive(
        Debug, Default, Clone, serde::Serialize, serde::Deserialize,
    )]
    #[serde(rename_all = "camelCase", default)]
    pub struct CoreChunkedModConfig {
        /// CoreChunked configuration.
        pub core_chunked: CoreChunkedConfig,
    }

    impl ferry_api::config::ModConfig for CoreChunkedModConfig {}
}

use config::*;

/// The production provider module backed by the chunked transfer engine.
#[derive(Debug)]
pub struct ChunkedProviderFactory {}

impl ChunkedProviderFactory {
    /// Construct a new ChunkedProviderFactory.
    pub fn create() -> DynProviderFactory {
        Arc::new(Self {})
    }
}

impl ProviderFactory for ChunkedProviderFactory {
    fn default_config(&self, config: &Config) -> FerryResult<()> {
        config.set_module_config(&CoreChunkedModConfig::default())?;
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<builder::Builder>,
        pipe: DynPipe,
        content_store: DynContentStore,
        locator: DynSourceLocator,
    ) -> BoxFut<'static, FerryResult<DynProvider>> {
        Box::pin(async move {
            let config: CoreChunkedModConfig =
                builder.config.get_module_config()?;
            let out: DynProvider = Arc::new(ChunkedProvider {
                config: config.core_chunked,
                pipe,
                content_store,
                locator,
            });
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct ChunkedProvider {
    config: CoreChunkedConfig,
    pipe: DynPipe,
    content_store: DynContentStore,
    locator: DynSourceLocator,
}

impl Provider for ChunkedProvider {
    fn create_transfer(
        &self,
        content: &ContentRef,
    ) -> BoxFut<'_, FerryResult<Option<DynTransfer>>> {
        let content = content.clone();
        Box::pin(async move {
            let out: DynTransfer = ChunkedTransfer::new(
                self.config.clone(),
                content,
                self.pipe.clone(),
                self.content_store.clone(),
                self.locator.clone(),
            );
            Ok(Some(out))
        })
    }
}

#[derive(Debug)]
enum Cmd {
    Cancel,
}

#[derive(Debug)]
struct Shared {
    state: TransferState,
    started: bool,
    content: Option<DynContent>,
    failure_cause: Option<FerryError>,
    listeners: Vec<DynTransferListener>,
    location: LocationState,
    known: Vec<Url>,
    untried: VecDeque<Url>,
    locate_task: Option<tokio::task::AbortHandle>,
}

/// A transfer retrieving one piece of content over the chunk protocol,
/// one source descriptor at a time.
#[derive(Debug)]
pub struct ChunkedTransfer {
    config: CoreChunkedConfig,
    content_id: ContentId,
    mime_type: String,
    declared_length: Option<u64>,
    pipe: DynPipe,
    content_store: DynContentStore,
    locator: DynSourceLocator,
    shared: Mutex<Shared>,
    cmd_tx: UnboundedSender<Cmd>,
    cmd_rx: Mutex<Option<UnboundedReceiver<Cmd>>>,
    driver_task: Mutex<Option<tokio::task::AbortHandle>>,
    weak_self: Weak<ChunkedTransfer>,
}

impl Drop for ChunkedTransfer {
    fn drop(&mut self) {
        if let Some(t) = self.driver_task.lock().unwrap().take() {
            t.abort();
        }
        if let Some(t) = self.shared.lock().unwrap().locate_task.take() {
            t.abort();
        }
    }
}

impl ChunkedTransfer {
    /// Construct a new ChunkedTransfer for the given content reference.
    pub fn new(
        config: CoreChunkedConfig,
        content: ContentRef,
        pipe: DynPipe,
        content_store: DynContentStore,
        locator: DynSourceLocator,
    ) -> Arc<Self> {
        let content_id = content.content_id().clone();
        let (mime_type, declared_length) = match &content {
            ContentRef::Id(_) => (None, None),
            ContentRef::Descriptor(d) => (d.mime_type.clone(), d.length),
        };
        let known: Vec<Url> = content.sources().to_vec();
        let untried: VecDeque<Url> = known.iter().cloned().collect();
        let (cmd_tx, cmd_rx) = unbounded_channel();

        Arc::new_cyclic(|weak_self| Self {
            config,
            content_id,
            mime_type: mime_type
                .unwrap_or_else(|| "application/octet-stream".into()),
            declared_length,
            pipe,
            content_store,
            locator,
            shared: Mutex::new(Shared {
                state: TransferState::Pending,
                started: false,
                content: None,
                failure_cause: None,
                listeners: Vec::new(),
                location: LocationState::default(),
                known,
                untried,
                locate_task: None,
            }),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            driver_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn set_state(&self, state: TransferState) {
        let listeners = {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == state || shared.state.is_finished() {
                return;
            }
            shared.state = state;
            shared.listeners.clone()
        };
        for l in listeners {
            if let Err(err) = l.on_state(&self.content_id, state) {
                tracing::warn!("transfer state listener failed: {err}");
            }
        }
    }

    fn notify_progress(&self, written: u64, total: Option<u64>) {
        let listeners = self.shared.lock().unwrap().listeners.clone();
        for l in listeners {
            if let Err(err) =
                l.on_progress(&self.content_id, written, total)
            {
                tracing::warn!("transfer progress listener failed: {err}");
            }
        }
    }

    fn notify_location(&self, state: LocationState, found: u32) {
        let listeners = self.shared.lock().unwrap().listeners.clone();
        for l in listeners {
            if let Err(err) =
                l.on_location(&self.content_id, state, found)
            {
                tracing::warn!("transfer location listener failed: {err}");
            }
        }
    }

    fn capture_cause(&self, err: FerryError) {
        let mut shared = self.shared.lock().unwrap();
        if shared.failure_cause.is_none() {
            shared.failure_cause = Some(err);
        }
    }

    fn next_untried(&self) -> Option<Url> {
        self.shared.lock().unwrap().untried.pop_front()
    }

    async fn driver(
        self: Arc<Self>,
        destination: PathBuf,
        mut cmd_rx: UnboundedReceiver<Cmd>,
    ) {
        self.set_state(TransferState::Retrieving);

        let outcome = loop {
            if let Ok(Cmd::Cancel) = cmd_rx.try_recv() {
                break DriverEnd::Cancelled;
            }

            let Some(peer) = self.next_untried() else {
                break DriverEnd::Exhausted;
            };

            // Every selected descriptor counts as tried, whatever the
            // outcome of its attempt.
            match self
                .run_attempt(&peer, &destination, &mut cmd_rx)
                .await
            {
                AttemptEnd::Completed(content) => {
                    break DriverEnd::Completed(content);
                }
                AttemptEnd::Stalled => {
                    tracing::debug!(
                        content_id = %self.content_id,
                        %peer,
                        "attempt stalled, moving to next descriptor",
                    );
                    self.capture_cause(FerryError::stalled(format!(
                        "no progress from {peer}"
                    )));
                }
                AttemptEnd::Unusable => {
                    tracing::debug!(
                        content_id = %self.content_id,
                        %peer,
                        "could not open channel, skipping descriptor",
                    );
                }
                AttemptEnd::Cancelled => break DriverEnd::Cancelled,
                AttemptEnd::Failed(err) => {
                    tracing::warn!(
                        content_id = %self.content_id,
                        %peer,
                        "attempt failed: {err}",
                    );
                    self.capture_cause(err);
                }
            }
        };

        match outcome {
            DriverEnd::Completed(content) => {
                self.shared.lock().unwrap().content = Some(content);
                self.set_state(TransferState::Completed);
            }
            DriverEnd::Exhausted => {
                self.capture_cause(FerryError::stalled(
                    "all known sources exhausted",
                ));
                self.set_state(TransferState::Stalled);
            }
            DriverEnd::Cancelled => {
                self.set_state(TransferState::Cancelled);
            }
        }

        self.stop_source_location();
    }

    async fn run_attempt(
        &self,
        peer: &Url,
        destination: &Path,
        cmd_rx: &mut UnboundedReceiver<Cmd>,
    ) -> AttemptEnd {
        let respond_to_url = match self.pipe.url() {
            Some(url) => url,
            None => {
                return AttemptEnd::Failed(FerryError::other(
                    "local pipe has no url",
                ));
            }
        };

        let inbox = {
            use std::sync::atomic::*;
            static NONCE: AtomicU64 = AtomicU64::new(1);
            let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
            format!("{CHUNK_RESP_MOD_PREFIX}{nonce}")
        };

        let (resp_tx, resp_rx) = channel(1024);
        self.pipe.register_module_handler(
            inbox.clone(),
            Arc::new(ChunkedMessageHandler {
                incoming_response_tx: resp_tx,
            }),
        );

        let result = self
            .attempt_protocol(
                peer,
                destination,
                &respond_to_url,
                &inbox,
                resp_rx,
                cmd_rx,
            )
            .await;

        // Resource release is unconditional: the inbox and the channel
        // to the source are torn down before any outcome is surfaced.
        self.pipe.unregister_module_handler(&inbox);
        self.pipe.close(peer.clone()).await;

        match result {
            Ok(LoopEnd::Completed) => {
                match self
                    .content_store
                    .materialize(
                        self.content_id.clone(),
                        instance_id(),
                        destination.to_path_buf(),
                        self.mime_type.clone(),
                    )
                    .await
                {
                    Ok(content) => AttemptEnd::Completed(content),
                    Err(err) => AttemptEnd::Failed(err),
                }
            }
            Ok(end) => {
                let _ = tokio::fs::remove_file(destination).await;
                match end {
                    LoopEnd::Completed => unreachable!(),
                    LoopEnd::Stalled => AttemptEnd::Stalled,
                    LoopEnd::Unusable => AttemptEnd::Unusable,
                    LoopEnd::Cancelled => AttemptEnd::Cancelled,
                }
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(destination).await;
                AttemptEnd::Failed(err)
            }
        }
    }

    async fn attempt_protocol(
        &self,
        peer: &Url,
        destination: &Path,
        respond_to_url: &Url,
        inbox: &str,
        mut resp_rx: Receiver<ChunkResponse>,
        cmd_rx: &mut UnboundedReceiver<Cmd>,
    ) -> FerryResult<LoopEnd> {
        let file = tokio::fs::File::create(destination)
            .await
            .map_err(|err| {
                FerryError::other_src(
                    format!(
                        "could not create destination {}",
                        destination.display()
                    ),
                    err,
                )
            })?;

        let mut attempt = Attempt::new(
            &self.config,
            self.content_id.clone(),
            self.pipe.clone(),
            peer.clone(),
            respond_to_url.clone(),
            inbox.to_string(),
            file,
        );

        if attempt.initial_fill().await == 0 {
            return Ok(LoopEnd::Unusable);
        }

        let interval = Duration::from_millis(
            self.config.health_check_interval_ms as u64,
        );
        let mut check = tokio::time::interval_at(
            tokio::time::Instant::now() + interval,
            interval,
        );
        check
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let stall_timeout =
            Duration::from_millis(self.config.stall_timeout_ms as u64);

        loop {
            tokio::select! {
                maybe_resp = resp_rx.recv() => {
                    if let Some(resp) = maybe_resp {
                        let before = attempt.written;
                        attempt.handle_response(resp).await?;
                        if attempt.written > before {
                            self.notify_progress(
                                attempt.written,
                                attempt.total().or(self.declared_length),
                            );
                        }
                    }
                }
                maybe_cmd = cmd_rx.recv() => {
                    if let Some(Cmd::Cancel) = maybe_cmd {
                        return Ok(LoopEnd::Cancelled);
                    }
                }
                _ = check.tick() => {
                    if attempt.last_progress.elapsed() > stall_timeout {
                        return Ok(LoopEnd::Stalled);
                    }
                    let before = attempt.written;
                    attempt.health_check().await?;
                    if attempt.written > before {
                        self.notify_progress(
                            attempt.written,
                            attempt.total().or(self.declared_length),
                        );
                    }
                }
            }

            if attempt.is_complete() {
                attempt.file.flush().await.map_err(|err| {
                    FerryError::other_src("could not flush destination", err)
                })?;
                return Ok(LoopEnd::Completed);
            }
        }
    }
}

fn instance_id() -> ContentId {
    use rand::Rng;
    let mut b = [0_u8; 32];
    rand::thread_rng().fill(&mut b[..]);
    ContentId::from(bytes::Bytes::copy_from_slice(&b))
}

enum DriverEnd {
    Completed(DynContent),
    Exhausted,
    Cancelled,
}

enum AttemptEnd {
    Completed(DynContent),
    Stalled,
    Unusable,
    Cancelled,
    Failed(FerryError),
}

enum LoopEnd {
    Completed,
    Stalled,
    Unusable,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// No request outstanding, no data held.
    Free,

    /// A request is on the wire since the recorded instant.
    Pending(Instant),

    /// The request could not be transmitted; resend on the next check.
    NeedsResend,

    /// Response data is held, awaiting its turn at the write cursor.
    Buffered,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    offset: u64,
    length: u32,
    data: Option<bytes::Bytes>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            offset: 0,
            length: 0,
            data: None,
        }
    }
}

struct Attempt {
    content_id: ContentId,
    pipe: DynPipe,
    peer: Url,
    respond_to_url: Url,
    inbox: String,
    max_request: u32,
    response_timeout: Duration,
    file: tokio::fs::File,
    slots: Vec<Slot>,
    written: u64,
    eof_offset: Option<u64>,
    next_offset: u64,
    last_progress: Instant,
}

impl Attempt {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: &CoreChunkedConfig,
        content_id: ContentId,
        pipe: DynPipe,
        peer: Url,
        respond_to_url: Url,
        inbox: String,
        file: tokio::fs::File,
    ) -> Self {
        let slots = (0..config.max_outstanding_requests.max(1))
            .map(|_| Slot::new())
            .collect();
        Self {
            content_id,
            pipe,
            peer,
            respond_to_url,
            inbox,
            max_request: config.max_request_bytes.max(1),
            response_timeout: Duration::from_millis(
                config.response_timeout_ms as u64,
            ),
            file,
            slots,
            written: 0,
            eof_offset: None,
            next_offset: 0,
            last_progress: Instant::now(),
        }
    }

    fn total(&self) -> Option<u64> {
        self.eof_offset
    }

    /// True while unclaimed byte ranges remain.
    fn remaining(&self) -> bool {
        self.eof_offset.map_or(true, |e| self.next_offset < e)
    }

    fn is_complete(&self) -> bool {
        match self.eof_offset {
            None => false,
            Some(e) => {
                self.written >= e
                    && self
                        .slots
                        .iter()
                        .all(|s| s.state == SlotState::Free)
            }
        }
    }

    /// Assign the next unclaimed range to a free slot and send its
    /// request.
    async fn assign_next(&mut self, idx: usize) {
        let offset = self.next_offset;
        let length = match self.eof_offset {
            None => self.max_request,
            Some(e) => {
                (e - offset).min(self.max_request as u64) as u32
            }
        };
        if length == 0 {
            return;
        }
        self.next_offset = offset + length as u64;
        self.slots[idx].offset = offset;
        self.slots[idx].length = length;
        self.slots[idx].data = None;
        self.send_request(idx).await;
    }

    /// Transmit the request a slot currently describes. A send failure
    /// marks the slot for resend rather than failing the attempt.
    async fn send_request(&mut self, idx: usize) {
        let request = ChunkRequest {
            content_id: self.content_id.0 .0.clone(),
            offset: self.slots[idx].offset,
            length: self.slots[idx].length,
            slot: idx as u32,
            respond_to_url: self.respond_to_url.as_str().into(),
            respond_to_module: self.inbox.clone(),
        };
        let data = serialize_request_message(request);
        match self
            .pipe
            .send_module(
                self.peer.clone(),
                CHUNK_REQ_MOD_NAME.to_string(),
                data,
            )
            .await
        {
            Ok(()) => {
                self.slots[idx].state = SlotState::Pending(Instant::now());
            }
            Err(err) => {
                tracing::debug!(
                    peer = %self.peer,
                    slot = idx,
                    "could not send chunk request: {err}",
                );
                self.slots[idx].state = SlotState::NeedsResend;
            }
        }
    }

    /// Claim initial ranges for every slot. Returns the number of
    /// requests actually transmitted; zero means the channel to this
    /// descriptor could not be opened at all.
    async fn initial_fill(&mut self) -> usize {
        for idx in 0..self.slots.len() {
            if self.remaining() {
                self.assign_next(idx).await;
            }
        }
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Pending(_)))
            .count()
    }

    /// Process one incoming chunk response. Invalid responses are
    /// logged and dropped without touching transfer state; the slot's
    /// own timeout eventually triggers the resend.
    async fn handle_response(
        &mut self,
        resp: ChunkResponse,
    ) -> FerryResult<()> {
        if resp.content_id[..] != self.content_id.0 .0[..] {
            tracing::warn!(
                expected = %self.content_id,
                "dropping response for wrong content",
            );
            return Ok(());
        }
        let idx = resp.slot as usize;
        if idx >= self.slots.len() {
            tracing::warn!(slot = idx, "dropping response for bad slot");
            return Ok(());
        }
        let slot = &self.slots[idx];
        if !matches!(
            slot.state,
            SlotState::Pending(_) | SlotState::NeedsResend
        ) || slot.offset != resp.offset
        {
            tracing::warn!(
                slot = idx,
                offset = resp.offset,
                "dropping duplicate or replayed response",
            );
            return Ok(());
        }
        if resp.length as usize != resp.data.len() {
            tracing::warn!(
                declared = resp.length,
                actual = resp.data.len(),
                "dropping response with mismatched length",
            );
            return Ok(());
        }

        self.last_progress = Instant::now();

        if resp.eof {
            let boundary = resp.offset + resp.data.len() as u64;
            let boundary =
                self.eof_offset.map_or(boundary, |e| e.min(boundary));
            self.eof_offset = Some(boundary);
            // Never claim ranges past a known boundary.
            self.next_offset = self.next_offset.min(boundary);
        }

        if resp.data.is_empty() {
            // Nothing to flush; with the boundary recorded the slot can
            // be retired or re-armed directly.
            self.slots[idx].state = SlotState::Free;
            self.slots[idx].data = None;
            self.reevaluate().await?;
            return Ok(());
        }

        self.slots[idx].data = Some(resp.data);
        self.slots[idx].state = SlotState::Buffered;

        self.flush_in_order().await?;
        if resp.eof {
            // Slots holding ranges past the boundary can never flush;
            // retire them now rather than waiting for the next tick.
            self.reevaluate().await?;
        }
        Ok(())
    }

    /// Flush every buffered slot whose offset has reached the write
    /// cursor, preparing each flushed slot's next request immediately.
    async fn flush_in_order(&mut self) -> FerryResult<()> {
        loop {
            let Some(idx) = self.slots.iter().position(|s| {
                s.state == SlotState::Buffered && s.offset == self.written
            }) else {
                return Ok(());
            };

            let data = self.slots[idx]
                .data
                .take()
                .expect("buffered slot holds data");
            self.file.write_all(&data).await.map_err(|err| {
                FerryError::other_src("could not write destination", err)
            })?;
            self.written += data.len() as u64;

            let requested = self.slots[idx].length;
            let got = data.len() as u32;
            self.prepare_request(idx, requested, got).await;
        }
    }

    /// Decide a flushed slot's next move: request the remainder of a
    /// partially satisfied range, retire past the known end of data, or
    /// claim the next unclaimed range.
    async fn prepare_request(
        &mut self,
        idx: usize,
        requested: u32,
        got: u32,
    ) {
        let advanced = self.slots[idx].offset + got as u64;
        let beyond_eof =
            self.eof_offset.map_or(false, |e| advanced >= e);

        if got < requested && !beyond_eof {
            self.slots[idx].offset = advanced;
            self.slots[idx].length = match self.eof_offset {
                None => requested - got,
                Some(e) => ((requested - got) as u64)
                    .min(e - advanced)
                    as u32,
            };
            self.slots[idx].data = None;
            self.send_request(idx).await;
        } else if self.remaining() {
            self.assign_next(idx).await;
        } else {
            self.slots[idx].state = SlotState::Free;
            self.slots[idx].data = None;
        }
    }

    /// Re-walk every slot after a state change that may have freed or
    /// invalidated ranges, in ascending index order.
    async fn reevaluate(&mut self) -> FerryResult<()> {
        self.flush_in_order().await?;
        for idx in 0..self.slots.len() {
            let beyond_eof = self
                .eof_offset
                .map_or(false, |e| self.slots[idx].offset >= e);
            match self.slots[idx].state {
                SlotState::Free => {
                    if self.remaining() {
                        self.assign_next(idx).await;
                    }
                }
                SlotState::Pending(_)
                | SlotState::NeedsResend
                | SlotState::Buffered
                    if beyond_eof =>
                {
                    self.slots[idx].state = SlotState::Free;
                    self.slots[idx].data = None;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The periodic slot walk: re-arm free slots, retry flushes, resend
    /// timed-out requests, retire slots past the end of data.
    async fn health_check(&mut self) -> FerryResult<()> {
        self.flush_in_order().await?;
        for idx in 0..self.slots.len() {
            let beyond_eof = self
                .eof_offset
                .map_or(false, |e| self.slots[idx].offset >= e);
            match self.slots[idx].state {
                SlotState::Free => {
                    if self.remaining() {
                        self.assign_next(idx).await;
                    }
                }
                SlotState::NeedsResend => {
                    if beyond_eof {
                        self.slots[idx].state = SlotState::Free;
                        self.slots[idx].data = None;
                    } else {
                        self.send_request(idx).await;
                    }
                }
                SlotState::Pending(since) => {
                    if beyond_eof {
                        self.slots[idx].state = SlotState::Free;
                        self.slots[idx].data = None;
                    } else if since.elapsed() > self.response_timeout {
                        self.send_request(idx).await;
                    }
                }
                SlotState::Buffered => {
                    // An in-order flush was already tried above; data
                    // buffered beyond the end of the stream can never
                    // flush and is discarded.
                    if beyond_eof {
                        self.slots[idx].state = SlotState::Free;
                        self.slots[idx].data = None;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Transfer for ChunkedTransfer {
    fn content_id(&self) -> ContentId {
        self.content_id.clone()
    }

    fn state(&self) -> TransferState {
        self.shared.lock().unwrap().state
    }

    fn content(&self) -> Option<DynContent> {
        self.shared.lock().unwrap().content.clone()
    }

    fn failure_cause(&self) -> Option<FerryError> {
        self.shared.lock().unwrap().failure_cause.clone()
    }

    fn location_state(&self) -> LocationState {
        self.shared.lock().unwrap().location
    }

    fn found_source_count(&self) -> u32 {
        self.shared.lock().unwrap().known.len() as u32
    }

    fn start_source_location(&self, goal: LocationGoal) {
        let threshold = match goal {
            LocationGoal::Enough => self.config.enough_source_count,
            LocationGoal::Many => self.config.many_source_count,
        };

        let (state, found) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.location.locating || shared.state.is_finished() {
                return;
            }
            let found = shared.known.len() as u32;
            if found >= threshold {
                if shared.location.saturated {
                    return;
                }
                shared.location.saturated = true;
                (shared.location, found)
            } else {
                shared.location = LocationState {
                    locating: true,
                    saturated: false,
                };
                let this = self.weak_self.clone();
                let interval = Duration::from_millis(
                    self.config.locate_interval_ms as u64,
                );
                let task = tokio::task::spawn(locate_task(
                    this, interval, threshold,
                ))
                .abort_handle();
                if let Some(old) = shared.locate_task.replace(task) {
                    old.abort();
                }
                (shared.location, found)
            }
        };

        self.notify_location(state, found);
    }

    fn stop_source_location(&self) {
        let notify = {
            let mut shared = self.shared.lock().unwrap();
            if let Some(task) = shared.locate_task.take() {
                task.abort();
            }
            if !shared.location.locating {
                None
            } else {
                shared.location.locating = false;
                Some((shared.location, shared.known.len() as u32))
            }
        };
        if let Some((state, found)) = notify {
            self.notify_location(state, found);
        }
    }

    fn start(&self, destination: PathBuf) -> FerryResult<()> {
        if destination.as_os_str().is_empty() {
            return Err(FerryError::setup("empty destination path"));
        }

        {
            let mut shared = self.shared.lock().unwrap();
            if shared.started {
                return Err(FerryError::setup(
                    "transfer already started",
                ));
            }
            if shared.state.is_finished() {
                return Err(FerryError::setup(
                    "transfer already finished",
                ));
            }
            shared.started = true;
        }

        let this = self.weak_self.upgrade().ok_or_else(|| {
            FerryError::other("transfer dropped before start")
        })?;
        let cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| FerryError::setup("transfer already started"))?;

        let task =
            tokio::task::spawn(this.driver(destination, cmd_rx))
                .abort_handle();
        *self.driver_task.lock().unwrap() = Some(task);

        Ok(())
    }

    fn cancel(&self) {
        let direct = {
            let shared = self.shared.lock().unwrap();
            if shared.state.is_finished() {
                return;
            }
            // The driver only reads commands while it is running;
            // before start, and after a terminal stall, the state is
            // settled directly.
            !shared.started
                || shared.state == TransferState::Stalled
        };

        if direct {
            self.set_state(TransferState::Cancelled);
            self.stop_source_location();
        } else {
            let _ = self.cmd_tx.send(Cmd::Cancel);
        }
    }

    fn add_listener(&self, listener: DynTransferListener) {
        self.shared.lock().unwrap().listeners.push(listener);
    }

    fn remove_listener(&self, listener: &DynTransferListener) {
        self.shared
            .lock()
            .unwrap()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }
}

async fn locate_task(
    this: Weak<ChunkedTransfer>,
    interval: Duration,
    threshold: u32,
) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(this) = this.upgrade() else {
            return;
        };

        if !this.shared.lock().unwrap().location.locating {
            return;
        }

        let found = match this
            .locator
            .locate(this.content_id.clone(), threshold)
            .await
        {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(
                    content_id = %this.content_id,
                    "source locator failed: {err}",
                );
                continue;
            }
        };

        let notify = {
            let mut shared = this.shared.lock().unwrap();
            let mut changed = false;
            for url in found {
                if !shared.known.contains(&url) {
                    shared.known.push(url.clone());
                    shared.untried.push_back(url);
                    changed = true;
                }
            }
            let count = shared.known.len() as u32;
            if count >= threshold {
                // Saturated; discovery winds itself down.
                shared.location = LocationState {
                    locating: false,
                    saturated: true,
                };
                shared.locate_task = None;
                Some((shared.location, count, true))
            } else if changed {
                Some((shared.location, count, false))
            } else {
                None
            }
        };

        if let Some((state, count, done)) = notify {
            this.notify_location(state, count);
            if done {
                return;
            }
        }
    }
}
