//! Per-page merge resolver
//!
//! The resolver is an actor task owning all merge state of one page. It is
//! fed by commands (conflict checks, strategy swaps, convergence waiters)
//! and by commit-arrival notifications from the page storage, and brings the
//! page back to a single head whenever it diverges.
//!
//! # State machine
//!
//! ```text
//!            new commits / set strategy / waiter
//!   Idle ──────────────────────────────────────> CheckingConflicts
//!    ^                                              │      │     │
//!    │          1 head: fire waiters                │      │     │
//!    ├──────────────────────────────────────────────┘      │     │
//!    │                        2+ heads, merge commits,     │     │
//!    │                        remote trigger               v     │
//!    │                                              Delaying     │
//!    │                      backoff elapsed: re-check ──┘        │
//!    │                                                     2+ heads
//!    │   merge done / failed / cancelled: re-check               v
//!    └───────────────────────────────────────────────────── Merging
//! ```
//!
//! # Invariants
//!
//! - At most one merge is in flight: the only `MergeTask` lives in the
//!   actor's single `merge` slot, and checks are no-ops while it is full.
//! - Checks arriving while merging or delaying are coalesced: the re-check
//!   issued when the merge or delay ends subsumes them.
//! - A cancelled strategy never completes successfully after `cancel()`;
//!   the pending swap is adopted when the in-flight merge returns.

use crate::ancestor::find_common_ancestor;
use crate::backoff::{Backoff, BackoffConfig};
use crate::strategy::MergeStrategy;
use futures::future::BoxFuture;
use ledger_core::{
    order_by_age, ChangeSource, Commit, CommitId, CommitWatcher, LedgerError, LedgerResult,
    PageId, PageStorage,
};
use ledger_journal::JournalStorageExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

/// Externally visible state of the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverPhase {
    /// Nothing in flight
    Idle,
    /// Reading the head set
    CheckingConflicts,
    /// A merge is in flight
    Merging,
    /// Waiting for the storm-avoidance backoff to elapse
    Delaying,
}

/// How a convergence waiter was released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolutionOutcome {
    /// The page had a single head and nothing was merged since the last release
    NoConflicts,
    /// The page reached a single head through at least one merge
    ConflictsResolved,
}

/// Whether a check may be postponed by the storm-avoidance backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    /// Merge now
    DontDelay,
    /// Postpone merges between two merge commits
    MayDelay,
}

impl From<ChangeSource> for DelayPolicy {
    fn from(source: ChangeSource) -> Self {
        match source {
            ChangeSource::Local => DelayPolicy::DontDelay,
            ChangeSource::Remote => DelayPolicy::MayDelay,
        }
    }
}

/// Resolver tuning
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Delays between merges of two merge commits received from peers
    pub storm_backoff: BackoffConfig,
    /// Delays between retries of a failed merge round
    pub failure_backoff: BackoffConfig,
}

/// Merge counters of one resolver
#[derive(Debug, Default)]
pub struct ResolverStats {
    merges: AtomicU64,
    failures: AtomicU64,
    delays: AtomicU64,
}

impl ResolverStats {
    /// Merge commits produced
    pub fn merges(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    /// Merge rounds that failed (cancellations excluded)
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Merges postponed by the storm-avoidance backoff
    pub fn delays(&self) -> u64 {
        self.delays.load(Ordering::Relaxed)
    }
}

enum Command {
    CheckConflicts(DelayPolicy),
    SetStrategy(Option<Arc<dyn MergeStrategy>>),
    WaitForNoConflicts(oneshot::Sender<ConflictResolutionOutcome>),
}

/// Sender side shared by the handle and the storage watcher
#[derive(Clone)]
struct Mailbox {
    commands: mpsc::UnboundedSender<Command>,
    queued: Arc<AtomicUsize>,
}

impl Mailbox {
    fn send(&self, command: Command) -> bool {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(command).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }
}

struct ResolverWatcher {
    mailbox: Mailbox,
}

impl CommitWatcher for ResolverWatcher {
    fn on_new_commits(&self, _commits: &[Commit], source: ChangeSource) {
        self.mailbox.send(Command::CheckConflicts(source.into()));
    }
}

/// Handle to the merge resolver of one page
///
/// Dropping the handle unsubscribes from the storage and stops the actor.
/// Owners should wait for [`has_unfinished_merges`](Self::has_unfinished_merges)
/// to turn false first.
pub struct MergeResolver {
    page_id: PageId,
    storage: Arc<dyn PageStorage>,
    mailbox: Mailbox,
    watcher: Arc<dyn CommitWatcher>,
    phase: watch::Receiver<ResolverPhase>,
    stats: Arc<ResolverStats>,
    task: JoinHandle<()>,
}

impl MergeResolver {
    /// Start the resolver for a page with no strategy installed
    ///
    /// Subscribes to the storage's commit notifications and schedules an
    /// immediate conflict check. Must be called within a tokio runtime.
    pub fn new(storage: Arc<dyn PageStorage>, config: ResolverConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(ResolverPhase::Idle);
        let mailbox = Mailbox {
            commands,
            queued: Arc::new(AtomicUsize::new(0)),
        };
        let stats = Arc::new(ResolverStats::default());
        let page_id = storage.page_id().clone();

        let actor = ResolverActor {
            page_id: page_id.clone(),
            storage: Arc::clone(&storage),
            strategy: None,
            next_strategy: None,
            merge: None,
            delay: None,
            retry: None,
            storm_backoff: Backoff::new(config.storm_backoff),
            failure_backoff: Backoff::new(config.failure_backoff),
            has_merged: false,
            no_conflict_callbacks: Vec::new(),
            phase: phase_tx,
            queued: Arc::clone(&mailbox.queued),
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(actor.run(rx));

        let watcher: Arc<dyn CommitWatcher> = Arc::new(ResolverWatcher {
            mailbox: mailbox.clone(),
        });
        storage.add_commit_watcher(Arc::clone(&watcher));
        mailbox.send(Command::CheckConflicts(DelayPolicy::DontDelay));

        debug!(target: "ledger::resolver", page_id = %page_id, "Merge resolver started");
        Self {
            page_id,
            storage,
            mailbox,
            watcher,
            phase,
            stats,
            task,
        }
    }

    /// Page this resolver serves
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// Install a strategy, or remove it with `None`
    ///
    /// If a merge is in flight the current strategy is cancelled and the new
    /// one takes over once the merge returns.
    pub fn set_merge_strategy(&self, strategy: Option<Arc<dyn MergeStrategy>>) {
        self.mailbox.send(Command::SetStrategy(strategy));
    }

    /// Schedule a conflict check
    ///
    /// Heads are read even without a strategy installed, so waiters
    /// registered through [`register_no_conflict_callback`](Self::register_no_conflict_callback)
    /// are released once the page has a single head. Merging needs a strategy.
    pub fn check_conflicts(&self, policy: DelayPolicy) {
        self.mailbox.send(Command::CheckConflicts(policy));
    }

    /// Receiver released the next time the page is seen with a single head
    pub fn register_no_conflict_callback(&self) -> oneshot::Receiver<ConflictResolutionOutcome> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(Command::WaitForNoConflicts(tx));
        rx
    }

    /// Wait until the page is seen with a single head
    ///
    /// Never returns while the page has several heads and no strategy able
    /// to merge them; callers apply their own timeout.
    pub async fn wait_for_no_conflicts(&self) -> LedgerResult<ConflictResolutionOutcome> {
        self.register_no_conflict_callback()
            .await
            .map_err(|_| LedgerError::cancelled(format!("resolver of page {} stopped", self.page_id)))
    }

    /// Current phase
    pub fn phase(&self) -> ResolverPhase {
        *self.phase.borrow()
    }

    /// Whether a check, merge, or delay is in flight or commands are queued
    pub fn has_unfinished_merges(&self) -> bool {
        self.mailbox.queued.load(Ordering::Acquire) > 0 || self.phase() != ResolverPhase::Idle
    }

    /// Wait until [`has_unfinished_merges`](Self::has_unfinished_merges) is false
    pub async fn wait_until_idle(&self) {
        let mut phase = self.phase.clone();
        loop {
            phase.borrow_and_update();
            if !self.has_unfinished_merges() {
                return;
            }
            if phase.changed().await.is_err() {
                return;
            }
        }
    }

    /// Merge counters
    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }
}

impl Drop for MergeResolver {
    fn drop(&mut self) {
        self.storage.remove_commit_watcher(&self.watcher);
        self.task.abort();
        debug!(target: "ledger::resolver", page_id = %self.page_id, "Merge resolver stopped");
    }
}

/// The single in-flight merge of a resolver
struct MergeTask {
    strategy: Option<Arc<dyn MergeStrategy>>,
    future: BoxFuture<'static, LedgerResult<Commit>>,
}

impl MergeTask {
    /// Converge two heads with identical content without consulting a strategy
    fn identical(storage: Arc<dyn PageStorage>, left: Commit, right: Commit) -> Self {
        Self {
            strategy: None,
            future: Box::pin(async move {
                let journal = storage.start_merge_commit(left.id(), right.id()).await?;
                storage.commit_journal(journal).await
            }),
        }
    }

    fn with_strategy(
        storage: Arc<dyn PageStorage>,
        strategy: Arc<dyn MergeStrategy>,
        left: Commit,
        right: Commit,
    ) -> Self {
        let running = Arc::clone(&strategy);
        Self {
            strategy: Some(strategy),
            future: Box::pin(async move {
                let ancestor = find_common_ancestor(storage.as_ref(), &left, &right).await?;
                running.merge(&storage, &left, &right, &ancestor).await
            }),
        }
    }

    fn cancel(&self) {
        if let Some(strategy) = &self.strategy {
            strategy.cancel();
        }
    }
}

/// Resolves with the in-flight merge's result; pending while none runs
async fn merge_finished(merge: &mut Option<MergeTask>) -> LedgerResult<Commit> {
    match merge {
        Some(task) => (&mut task.future).await,
        None => std::future::pending().await,
    }
}

/// Resolves when the timer fires; pending while none is armed
async fn timer_fired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Load two heads, oldest first
async fn load_pair(
    storage: &dyn PageStorage,
    a: &CommitId,
    b: &CommitId,
) -> LedgerResult<(Commit, Commit)> {
    let a = storage.get_commit(a).await?;
    let b = storage.get_commit(b).await?;
    Ok(order_by_age(a, b))
}

struct ResolverActor {
    page_id: PageId,
    storage: Arc<dyn PageStorage>,
    strategy: Option<Arc<dyn MergeStrategy>>,
    /// Strategy swap requested while a merge was in flight
    next_strategy: Option<Option<Arc<dyn MergeStrategy>>>,
    merge: Option<MergeTask>,
    /// Storm-avoidance delay; checks are no-ops while armed
    delay: Option<Pin<Box<Sleep>>>,
    /// Retry after a failed round; does not block checks
    retry: Option<Pin<Box<Sleep>>>,
    storm_backoff: Backoff,
    failure_backoff: Backoff,
    has_merged: bool,
    no_conflict_callbacks: Vec<oneshot::Sender<ConflictResolutionOutcome>>,
    phase: watch::Sender<ResolverPhase>,
    queued: Arc<AtomicUsize>,
    stats: Arc<ResolverStats>,
}

impl ResolverActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                }
                result = merge_finished(&mut self.merge) => {
                    self.on_merge_finished(result).await;
                }
                _ = timer_fired(&mut self.delay) => {
                    self.delay = None;
                    debug!(target: "ledger::resolver", page_id = %self.page_id, "Merge delay elapsed");
                    self.check_conflicts(DelayPolicy::DontDelay).await;
                }
                _ = timer_fired(&mut self.retry) => {
                    self.retry = None;
                    self.check_conflicts(DelayPolicy::DontDelay).await;
                }
            }
            self.publish_phase();
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::CheckConflicts(policy) => self.check_conflicts(policy).await,
            Command::SetStrategy(strategy) => self.set_strategy(strategy).await,
            Command::WaitForNoConflicts(callback) => {
                self.no_conflict_callbacks.push(callback);
                self.check_conflicts(DelayPolicy::DontDelay).await;
            }
        }
    }

    fn settled_phase(&self) -> ResolverPhase {
        if self.merge.is_some() {
            ResolverPhase::Merging
        } else if self.delay.is_some() {
            ResolverPhase::Delaying
        } else {
            ResolverPhase::Idle
        }
    }

    /// Publish the phase; always wakes waiters so queue changes are observed
    fn publish_phase(&self) {
        self.phase.send_replace(self.settled_phase());
    }

    async fn set_strategy(&mut self, strategy: Option<Arc<dyn MergeStrategy>>) {
        if let Some(merge) = &self.merge {
            debug!(
                target: "ledger::resolver",
                page_id = %self.page_id,
                "Strategy swap requested during merge, cancelling current strategy"
            );
            merge.cancel();
            self.next_strategy = Some(strategy);
            return;
        }
        let check = strategy.is_some();
        self.strategy = strategy;
        if check {
            self.check_conflicts(DelayPolicy::DontDelay).await;
        }
    }

    async fn check_conflicts(&mut self, policy: DelayPolicy) {
        if self.merge.is_some() || self.delay.is_some() {
            return;
        }
        self.phase.send_replace(ResolverPhase::CheckingConflicts);

        let heads = match self.storage.get_head_commit_ids().await {
            Ok(heads) => heads,
            Err(e) => {
                warn!(
                    target: "ledger::resolver",
                    page_id = %self.page_id,
                    error = %e,
                    "Failed to read heads, abandoning conflict check"
                );
                return;
            }
        };

        if heads.len() == 1 {
            self.fire_no_conflict_callbacks();
            return;
        }
        if heads.is_empty() {
            warn!(target: "ledger::resolver", page_id = %self.page_id, "Page has no head");
            return;
        }
        let Some(strategy) = self.strategy.clone() else {
            debug!(
                target: "ledger::resolver",
                page_id = %self.page_id,
                heads = heads.len(),
                "Conflict left in place, no merge strategy"
            );
            return;
        };

        // Heads come sorted by (timestamp, id): merge the two oldest and let
        // the re-check after this merge pick up the rest.
        let (left, right) = match load_pair(self.storage.as_ref(), &heads[0], &heads[1]).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    target: "ledger::resolver",
                    page_id = %self.page_id,
                    error = %e,
                    "Failed to load heads, abandoning conflict check"
                );
                return;
            }
        };

        if left.is_merge() && right.is_merge() && policy == DelayPolicy::MayDelay {
            let delay = self.storm_backoff.next_delay();
            self.stats.delays.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "ledger::resolver",
                page_id = %self.page_id,
                delay_ms = delay.as_millis() as u64,
                "Both heads are merge commits, delaying merge"
            );
            self.delay = Some(Box::pin(sleep(delay)));
            return;
        }
        self.storm_backoff.reset();

        debug!(
            target: "ledger::resolver",
            page_id = %self.page_id,
            heads = heads.len(),
            left = %left.id().short(),
            right = %right.id().short(),
            strategy = strategy.name(),
            "Merging heads"
        );
        let storage = Arc::clone(&self.storage);
        self.merge = Some(if left.root_id() == right.root_id() {
            MergeTask::identical(storage, left, right)
        } else {
            MergeTask::with_strategy(storage, strategy, left, right)
        });
    }

    fn fire_no_conflict_callbacks(&mut self) {
        let outcome = if self.has_merged {
            ConflictResolutionOutcome::ConflictsResolved
        } else {
            ConflictResolutionOutcome::NoConflicts
        };
        self.has_merged = false;
        for callback in self.no_conflict_callbacks.drain(..) {
            // The waiter may have given up.
            let _ = callback.send(outcome);
        }
    }

    async fn on_merge_finished(&mut self, result: LedgerResult<Commit>) {
        self.merge = None;
        let swapped = self.next_strategy.is_some();
        if let Some(next) = self.next_strategy.take() {
            self.strategy = next;
        }

        match result {
            Ok(commit) => {
                self.has_merged = true;
                self.failure_backoff.reset();
                self.stats.merges.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "ledger::resolver",
                    page_id = %self.page_id,
                    commit_id = %commit.id().short(),
                    "Merge commit created"
                );
            }
            Err(LedgerError::Cancelled(_)) if swapped => {
                debug!(
                    target: "ledger::resolver",
                    page_id = %self.page_id,
                    "Merge cancelled by strategy swap"
                );
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                if !swapped {
                    let delay = self.failure_backoff.next_delay();
                    warn!(
                        target: "ledger::resolver",
                        page_id = %self.page_id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Merge failed, retrying later"
                    );
                    self.retry = Some(Box::pin(sleep(delay)));
                    return;
                }
                warn!(
                    target: "ledger::resolver",
                    page_id = %self.page_id,
                    error = %e,
                    "Merge failed during strategy swap"
                );
            }
        }
        self.check_conflicts(DelayPolicy::DontDelay).await;
    }
}
