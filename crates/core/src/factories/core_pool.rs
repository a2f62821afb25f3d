//! Pool is the ferry module that aggregates per-provider transfers for
//! one piece of content and arbitrates which one is live.
//!
//! It consists of multiple parts:
//! - Construction polls an ordered provider list for candidates,
//!   tolerating providers that decline, then shuffles the result so
//!   repeated retrievals do not always favor the same provider
//! - Three disjoint pools partition the candidates: `selected` (the 0
//!   or 1 live attempt), `standby` (a bounded queue of warmed-up
//!   alternates), and `idle` (untried candidates)
//! - A per-child listener feeds child events back into the pool:
//!   progress is surfaced only for the selected child, a child reaching
//!   a finished-but-unsuccessful (or stalled) state is evicted and a
//!   replacement promoted, and a completed child short-circuits
//!   everything
//!
//! ### Event ordering
//!
//! "Source selected" always fires before any state event sourced from
//! the newly selected child, so listeners see a source before its
//! state. All listener dispatch happens outside the pool's lock.
//!
//! ### Failure policy
//!
//! Child failures are absorbed and converted into promotion of the next
//! candidate. Only exhaustion of every candidate, or an explicit
//! cancellation, settles the aggregate. Cancellation wakes waiters
//! immediately and defers cancelling children to a settle point, so an
//! in-flight child success cannot overwrite an already-cancelled
//! result.

use ferry_api::{content::*, transfer::*, *};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;


/// CorePool configuration types.
pub mod config {
    /// Configuration parameters for [PoolTransfer](super::PoolTransfer).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct CorePoolConfig {
        /// How many standby candidates are kept warm behind the
        /// selected one. Default: 2.
        pub standby_capacity: u32,

        /// Seed for the candidate shuffle. Unset means a fresh entropy
        /// seed per aggregate; set it for deterministic tests.
        pub shuffle_seed: Option<u64>,
    }

    impl Default for CorePoolConfig {
        fn default() -> Self {
            Self {
                standby_capacity: 2,
                shuffle_seed: None,
            }
        }
    }

    /// Module-level configuration for CorePool.
    #[derive(
        Debug, Default, Clone, serde::Serialize, serde::Deserialize,
    )]
    #[serde(rename_all = "camelCase", default)]
    pub struct CorePoolModConfig {
        /// CorePool configuration.
        pub core_pool: CorePoolConfig,
    }

    impl ferry_api::config::ModConfig for CorePoolModConfig {}
}

pub use config::*;

/// One candidate and the listener the pool registered on it.
#[derive(Debug, Clone)]
struct Child {
    transfer: DynTransfer,
    listener: DynTransferListener,
}

impl Child {
    fn is(&self, transfer: &DynTransfer) -> bool {
        Arc::ptr_eq(&self.transfer, transfer)
    }
}

#[derive(Debug)]
struct Pool {
    state: TransferState,
    standby_capacity: usize,
    selected: Option<Child>,
    standby: VecDeque<Child>,
    idle: Vec<Child>,
    listeners: Vec<DynTransferListener>,
    locating: bool,
    started: bool,
    destination: Option<PathBuf>,
    content: Option<DynContent>,
    last_cause: Option<FerryError>,
}

/// An aggregate transfer owning one candidate transfer per provider and
/// arbitrating which one drives the active byte transfer.
#[derive(Debug)]
pub struct PoolTransfer {
    content_id: ContentId,
    inner: Mutex<Pool>,
    state_tx: tokio::sync::watch::Sender<TransferState>,
}

enum LocCmd {
    Start(LocationGoal),
    Stop,
}

impl PoolTransfer {
    /// Construct an aggregate transfer for the given content reference.
    ///
    /// Each provider is asked, in order, to construct a transfer for
    /// the reference; providers that decline or signal unsupported are
    /// tolerated. The resulting candidates are shuffled (seedable via
    /// config) and start out idle. Zero usable candidates is a setup
    /// error.
    pub async fn create(
        config: CorePoolConfig,
        providers: &[DynProvider],
        content: ContentRef,
    ) -> FerryResult<Arc<Self>> {
        let content_id = content.content_id().clone();

        let mut candidates: Vec<DynTransfer> = Vec::new();
        for provider in providers {
            match provider.create_transfer(&content).await {
                Ok(Some(transfer)) => candidates.push(transfer),
                Ok(None) => {}
                Err(err) if err.is_unsupported() => {
                    tracing::debug!(
                        %content_id,
                        "provider declined content reference: {err}",
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        %content_id,
                        "provider could not construct transfer: {err}",
                    );
                }
            }
        }

        if candidates.is_empty() {
            return Err(FerryError::setup(format!(
                "no usable transfer candidates for {content_id}"
            )));
        }

        let mut rng = match config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        candidates.shuffle(&mut rng);

        let (state_tx, _) =
            tokio::sync::watch::channel(TransferState::Pending);

        let standby_capacity = config.standby_capacity as usize;

        let this = Arc::new_cyclic(|weak_self: &Weak<PoolTransfer>| {
            let idle = candidates
                .iter()
                .map(|transfer| {
                    let listener: DynTransferListener =
                        Arc::new(ChildListener {
                            pool: weak_self.clone(),
                            child: Arc::downgrade(transfer),
                        });
                    Child {
                        transfer: transfer.clone(),
                        listener,
                    }
                })
                .collect();

            PoolTransfer {
                content_id,
                inner: Mutex::new(Pool {
                    state: TransferState::Pending,
                    standby_capacity,
                    selected: None,
                    standby: VecDeque::new(),
                    idle,
                    listeners: Vec::new(),
                    locating: false,
                    started: false,
                    destination: None,
                    content: None,
                    last_cause: None,
                }),
                state_tx,
            }
        });

        // Children report back through the pool's listener from here on.
        let children = this.inner.lock().unwrap().idle.clone();
        for child in children {
            child.transfer.add_listener(child.listener.clone());
        }

        Ok(this)
    }

    /// The content this aggregate retrieves.
    pub fn content_id(&self) -> ContentId {
        self.content_id.clone()
    }

    /// Current aggregate lifecycle state.
    pub fn state(&self) -> TransferState {
        self.inner.lock().unwrap().state
    }

    /// The retrieved content, present once the aggregate completed.
    pub fn content(&self) -> Option<DynContent> {
        self.inner.lock().unwrap().content.clone()
    }

    /// Current aggregate source-location state.
    pub fn location_state(&self) -> LocationState {
        let pool = self.inner.lock().unwrap();
        LocationState {
            locating: pool.locating,
            saturated: pool
                .selected
                .as_ref()
                .map(|c| c.transfer.location_state().saturated)
                .unwrap_or(false),
        }
    }

    /// The transfer currently driving the active byte transfer, if any.
    pub fn current_transfer(&self) -> Option<DynTransfer> {
        self.inner
            .lock()
            .unwrap()
            .selected
            .as_ref()
            .map(|c| c.transfer.clone())
    }

    /// Snapshot of every candidate still owned by the aggregate:
    /// selected first, then standby, then idle.
    pub fn transfer_list(&self) -> Vec<DynTransfer> {
        let pool = self.inner.lock().unwrap();
        pool.selected
            .iter()
            .chain(pool.standby.iter())
            .chain(pool.idle.iter())
            .map(|c| c.transfer.clone())
            .collect()
    }

    /// Register a listener for aggregate events.
    pub fn add_listener(&self, listener: DynTransferListener) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    /// Remove a previously registered listener (matched by identity).
    pub fn remove_listener(&self, listener: &DynTransferListener) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Begin source discovery across the aggregate. Idempotent.
    pub fn start_source_location(&self) {
        {
            let mut pool = self.inner.lock().unwrap();
            if pool.locating || pool.state.is_finished() {
                return;
            }
            pool.locating = true;
        }
        self.promote();
        self.apply_location_policy();
    }

    /// Stop source discovery across the aggregate. Idempotent: a second
    /// call sends no further stop signals to children.
    pub fn stop_source_location(&self) {
        {
            let mut pool = self.inner.lock().unwrap();
            if !pool.locating {
                return;
            }
            pool.locating = false;
        }
        self.apply_location_policy();
    }

    /// Begin moving bytes into the destination file. Must be called
    /// exactly once per aggregate; a second call, or an empty
    /// destination, is a programming error reported as a setup error.
    pub fn start_transfer(&self, destination: PathBuf) -> FerryResult<()> {
        if destination.as_os_str().is_empty() {
            return Err(FerryError::setup("empty destination path"));
        }

        {
            let mut pool = self.inner.lock().unwrap();
            if pool.started {
                return Err(FerryError::setup(
                    "aggregate transfer already started",
                ));
            }
            if pool.state.is_finished() {
                return Err(FerryError::setup(
                    "aggregate transfer already finished",
                ));
            }
            pool.started = true;
            pool.destination = Some(destination);
        }

        self.set_state(TransferState::Retrieving);
        self.promote();
        self.apply_location_policy();
        Ok(())
    }

    /// Block the caller until the aggregate reaches a terminal state,
    /// or the timeout elapses.
    ///
    /// Returns the retrieved content on completion; rethrows the
    /// captured cause on failure; returns [FerryError::Cancelled] after
    /// a cancellation so callers can skip retry logic.
    pub async fn wait_for(
        &self,
        timeout: Option<Duration>,
    ) -> FerryResult<DynContent> {
        let mut rx = self.state_tx.subscribe();
        let finished = async move {
            loop {
                let state = *rx.borrow_and_update();
                if state.is_finished() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        };

        let state = match timeout {
            None => finished.await,
            Some(timeout) => tokio::time::timeout(timeout, finished)
                .await
                .map_err(|_| {
                    FerryError::other("timed out waiting for transfer")
                })?,
        };

        match state {
            TransferState::Completed => self
                .inner
                .lock()
                .unwrap()
                .content
                .clone()
                .ok_or_else(|| {
                    FerryError::other("transfer completed without content")
                }),
            TransferState::Cancelled => Err(FerryError::Cancelled),
            _ => Err(self
                .inner
                .lock()
                .unwrap()
                .last_cause
                .clone()
                .unwrap_or_else(|| {
                    FerryError::other("transfer failed")
                })),
        }
    }

    /// Cancel the aggregate. Waiters are woken immediately; children
    /// are cancelled at a settle point afterwards.
    pub fn cancel(&self) {
        let children = {
            let pool = self.inner.lock().unwrap();
            if pool.state.is_finished() {
                return;
            }
            pool.selected
                .iter()
                .chain(pool.standby.iter())
                .chain(pool.idle.iter())
                .cloned()
                .collect::<Vec<_>>()
        };

        self.set_state(TransferState::Cancelled);

        tokio::task::spawn(async move {
            for child in children {
                child.transfer.remove_listener(&child.listener);
                child.transfer.stop_source_location();
                child.transfer.cancel();
            }
        });
    }

    fn set_state(&self, state: TransferState) {
        let listeners = {
            let mut pool = self.inner.lock().unwrap();
            if pool.state == state || pool.state.is_finished() {
                return;
            }
            pool.state = state;
            pool.listeners.clone()
        };
        self.state_tx.send_replace(state);
        for l in listeners {
            if let Err(err) = l.on_state(&self.content_id, state) {
                tracing::warn!("aggregate state listener failed: {err}");
            }
        }
    }

    fn notify_source_selected(&self, selected: &DynTransfer) {
        let listeners = self.inner.lock().unwrap().listeners.clone();
        for l in listeners {
            if let Err(err) =
                l.on_source_selected(&self.content_id, selected)
            {
                tracing::warn!(
                    "aggregate source-selected listener failed: {err}"
                );
            }
        }
    }

    /// Refill standby from idle up to capacity. Pool lock must be held.
    fn backfill_locked(pool: &mut Pool) {
        while pool.standby.len() < pool.standby_capacity
            && !pool.idle.is_empty()
        {
            pool.standby.push_back(pool.idle.remove(0));
        }
    }

    fn evict_locked(
        pool: &mut Pool,
        transfer: &DynTransfer,
    ) -> (bool, Option<Child>) {
        if pool
            .selected
            .as_ref()
            .map(|c| c.is(transfer))
            .unwrap_or(false)
        {
            return (true, pool.selected.take());
        }
        if let Some(i) =
            pool.standby.iter().position(|c| c.is(transfer))
        {
            return (false, pool.standby.remove(i));
        }
        if let Some(i) = pool.idle.iter().position(|c| c.is(transfer)) {
            return (false, Some(pool.idle.remove(i)));
        }
        (false, None)
    }

    /// The selection/failover core: ensure a healthy selected transfer
    /// exists, promoting from standby (preferred) then idle, starting
    /// it if the byte transfer is under way, and failing the aggregate
    /// permanently once no candidates remain.
    fn promote(&self) {
        enum Next {
            Done,
            Exhausted,
            Selected(Child, Option<PathBuf>),
        }

        loop {
            let mut stale: Option<Child> = None;
            let next = {
                let mut pool = self.inner.lock().unwrap();
                if pool.state.is_finished() {
                    Next::Done
                } else {
                    let unhealthy = match &pool.selected {
                        None => true,
                        Some(c) => {
                            let st = c.transfer.state();
                            (st.is_finished() && !st.is_successful())
                                || st == TransferState::Stalled
                        }
                    };
                    if !unhealthy {
                        Self::backfill_locked(&mut pool);
                        Next::Done
                    } else {
                        // A lingering unhealthy selected entry is
                        // replaced outright.
                        stale = pool.selected.take();
                        let promoted =
                            pool.standby.pop_front().or_else(|| {
                                if pool.idle.is_empty() {
                                    None
                                } else {
                                    Some(pool.idle.remove(0))
                                }
                            });
                        match promoted {
                            None => Next::Exhausted,
                            Some(child) => {
                                pool.selected = Some(child.clone());
                                Self::backfill_locked(&mut pool);
                                let dest = if pool.started {
                                    pool.destination.clone()
                                } else {
                                    None
                                };
                                Next::Selected(child, dest)
                            }
                        }
                    }
                }
            };

            if let Some(stale) = stale {
                stale.transfer.remove_listener(&stale.listener);
                stale.transfer.stop_source_location();
                if !stale.transfer.state().is_finished() {
                    stale.transfer.cancel();
                }
            }

            match next {
                Next::Done => return,
                Next::Exhausted => {
                    let cause = {
                        let mut pool = self.inner.lock().unwrap();
                        pool.last_cause
                            .get_or_insert_with(|| {
                                FerryError::other(
                                    "no transfer candidates remain",
                                )
                            })
                            .clone()
                    };
                    tracing::debug!(
                        content_id = %self.content_id,
                        "aggregate transfer failed: {cause}",
                    );
                    self.set_state(TransferState::Failed);
                    return;
                }
                Next::Selected(child, dest) => {
                    // Listeners must see the source before its state.
                    self.notify_source_selected(&child.transfer);

                    let state = child.transfer.state();
                    if state.is_successful() {
                        self.finish_completed(&child.transfer);
                        return;
                    }
                    if (state.is_finished() && !state.is_successful())
                        || state == TransferState::Stalled
                    {
                        self.discard(&child);
                        continue;
                    }

                    if let Some(dest) = dest {
                        if let Err(err) = child.transfer.start(dest) {
                            tracing::warn!(
                                content_id = %self.content_id,
                                "could not start selected transfer: {err}",
                            );
                            self.inner.lock().unwrap().last_cause =
                                Some(err);
                            self.discard(&child);
                            continue;
                        }
                    }

                    return;
                }
            }
        }
    }

    /// Remove a child from the aggregate for good: out of its pool, out
    /// of its listener set, and cancelled if it can still run.
    fn discard(&self, child: &Child) {
        {
            let mut pool = self.inner.lock().unwrap();
            Self::evict_locked(&mut pool, &child.transfer);
            Self::backfill_locked(&mut pool);
        }
        child.transfer.remove_listener(&child.listener);
        child.transfer.stop_source_location();
        if !child.transfer.state().is_finished() {
            child.transfer.cancel();
        }
    }

    fn finish_completed(&self, winner: &DynTransfer) {
        let (others, winner_child) = {
            let mut pool = self.inner.lock().unwrap();
            if pool.state.is_finished() {
                return;
            }
            pool.content = winner.content();

            let (_, winner_child) =
                Self::evict_locked(&mut pool, winner);
            let mut others: Vec<Child> =
                pool.selected.take().into_iter().collect();
            others.extend(pool.standby.drain(..));
            others.extend(pool.idle.drain(..));

            // The winner remains visible as the current transfer.
            pool.selected = winner_child.clone();
            (others, winner_child)
        };

        if winner_child.is_none() {
            tracing::warn!(
                content_id = %self.content_id,
                "completed transfer was not owned by this aggregate",
            );
        }

        self.set_state(TransferState::Completed);

        // Deafen before cancelling so no spurious events surface.
        for child in others {
            child.transfer.remove_listener(&child.listener);
            child.transfer.stop_source_location();
            child.transfer.cancel();
        }
    }

    /// Apply the discovery threshold policy: while aggregate discovery
    /// is enabled the selected transfer discovers toward "many" and
    /// each standby toward "enough" (each child saturates itself at its
    /// threshold); with discovery disabled, every child is told to
    /// stop, unconditionally.
    fn apply_location_policy(&self) {
        let cmds = {
            let pool = self.inner.lock().unwrap();
            let mut cmds: Vec<(DynTransfer, LocCmd)> = Vec::new();
            if !pool.locating || pool.state.is_finished() {
                for c in pool
                    .selected
                    .iter()
                    .chain(pool.standby.iter())
                    .chain(pool.idle.iter())
                {
                    cmds.push((c.transfer.clone(), LocCmd::Stop));
                }
            } else {
                if let Some(c) = &pool.selected {
                    cmds.push((
                        c.transfer.clone(),
                        LocCmd::Start(LocationGoal::Many),
                    ));
                }
                for c in pool.standby.iter() {
                    cmds.push((
                        c.transfer.clone(),
                        LocCmd::Start(LocationGoal::Enough),
                    ));
                }
                for c in pool.idle.iter() {
                    cmds.push((c.transfer.clone(), LocCmd::Stop));
                }
            }
            cmds
        };

        for (transfer, cmd) in cmds {
            match cmd {
                LocCmd::Start(goal) => {
                    transfer.start_source_location(goal)
                }
                LocCmd::Stop => transfer.stop_source_location(),
            }
        }
    }

    fn child_progress(
        &self,
        child: &DynTransfer,
        written: u64,
        total: Option<u64>,
    ) {
        let listeners = {
            let pool = self.inner.lock().unwrap();
            // Only the selected transfer's progress is surfaced.
            if !pool
                .selected
                .as_ref()
                .map(|c| c.is(child))
                .unwrap_or(false)
            {
                return;
            }
            pool.listeners.clone()
        };
        for l in listeners {
            if let Err(err) =
                l.on_progress(&self.content_id, written, total)
            {
                tracing::warn!(
                    "aggregate progress listener failed: {err}"
                );
            }
        }
    }

    fn child_location(
        &self,
        _child: &DynTransfer,
        state: LocationState,
        found: u32,
    ) {
        let listeners = self.inner.lock().unwrap().listeners.clone();
        for l in listeners {
            if let Err(err) =
                l.on_location(&self.content_id, state, found)
            {
                tracing::warn!(
                    "aggregate location listener failed: {err}"
                );
            }
        }
        self.apply_location_policy();
    }

    fn child_state(&self, child: &DynTransfer, state: TransferState) {
        if state.is_successful() {
            // A completed child short-circuits everything, even one
            // still sitting in the idle pool: content found locally or
            // cheaply wins immediately.
            self.finish_completed(child);
            return;
        }

        if !(state.is_finished() || state == TransferState::Stalled) {
            return;
        }

        let (was_selected, evicted) = {
            let mut pool = self.inner.lock().unwrap();
            if pool.state.is_finished() {
                return;
            }
            if let Some(cause) = child.failure_cause() {
                pool.last_cause = Some(cause);
            }
            let (was_selected, evicted) =
                Self::evict_locked(&mut pool, child);
            Self::backfill_locked(&mut pool);
            (was_selected, evicted)
        };

        if let Some(evicted) = evicted {
            evicted.transfer.remove_listener(&evicted.listener);
            evicted.transfer.stop_source_location();
            if !state.is_finished() {
                evicted.transfer.cancel();
            }
        }

        if was_selected {
            self.promote();
        }
        self.apply_location_policy();
    }
}

/// The listener the pool registers on each child transfer.
#[derive(Debug)]
struct ChildListener {
    pool: Weak<PoolTransfer>,
    child: Weak<dyn Transfer>,
}

impl ChildListener {
    fn with_pool(
        &self,
        f: impl FnOnce(Arc<PoolTransfer>, DynTransfer),
    ) {
        if let (Some(pool), Some(child)) =
            (self.pool.upgrade(), self.child.upgrade())
        {
            f(pool, child);
        }
    }
}

impl TransferListener for ChildListener {
    fn on_progress(
        &self,
        _content_id: &ContentId,
        written: u64,
        total: Option<u64>,
    ) -> FerryResult<()> {
        self.with_pool(|pool, child| {
            pool.child_progress(&child, written, total)
        });
        Ok(())
    }

    fn on_state(
        &self,
        _content_id: &ContentId,
        state: TransferState,
    ) -> FerryResult<()> {
        self.with_pool(|pool, child| pool.child_state(&child, state));
        Ok(())
    }

    fn on_location(
        &self,
        _content_id: &ContentId,
        state: LocationState,
        found: u32,
    ) -> FerryResult<()> {
        self.with_pool(|pool, child| {
            pool.child_location(&child, state, found)
        });
        Ok(())
    }
}
