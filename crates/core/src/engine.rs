//! The replay engine.
//!
//! [`SyncEngine`] owns the state store and one source/target adapter pair.
//! A cycle fetches changesets after the cursor into the pending queue and
//! then drains the queue one changeset at a time:
//!
//! 1. Admission hook (a veto stops the loop, the changeset stays queued).
//! 2. Source update of the working directory, then target replay.
//! 3. Conflict handling: hook, then the source's automatic policy, then a
//!    pause that leaves the changeset queued.
//! 4. Commit (or defer it when the commit hook says so).
//! 5. Checkpoint: dequeue and move the cursor in one transaction.
//!
//! Nothing but a checkpoint consumes the queue, so any failure leaves the
//! failing changeset and everything after it queued for the next run.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::changeset::Changeset;
use crate::commit_format::CommitFormatter;
use crate::config::ReplayOptions;
use crate::db::{ApplyEvent, Database, PendingChangeset, SYNC_STATE_KEY};
use crate::errors::{CoreError, SyncError};
use crate::source::{SourceAdapter, INITIAL};
use crate::target::{ExcludeRules, TargetAdapter};

/// Shared flag that asks a running engine to stop before its next checkpoint.
pub type CancelFlag = Arc<AtomicBool>;


// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Fetching,
    Pending,
    Applying,
    Conflict,
    Done,
    Aborted,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Pending => write!(f, "pending"),
            Self::Applying => write!(f, "applying"),
            Self::Conflict => write!(f, "conflict"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl SyncState {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "fetching" => Self::Fetching,
            "pending" => Self::Pending,
            "applying" => Self::Applying,
            "conflict" => Self::Conflict,
            "done" => Self::Done,
            "aborted" => Self::Aborted,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// What to do with a changeset whose replay reported conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// The conflicts were dealt with; commit and checkpoint.
    Continue,
    /// Stop the loop and leave the changeset queued.
    Abort,
}

pub type AdmissionHook = Box<dyn Fn(&Changeset) -> bool + Send + Sync>;
pub type CommitHook = Box<dyn Fn(&Changeset) -> bool + Send + Sync>;
pub type AppliedHook = Box<dyn Fn(&Changeset) + Send + Sync>;
pub type ConflictHandler = Box<dyn Fn(&Changeset, &[String]) -> ConflictDecision + Send + Sync>;

/// Optional callbacks from the driving layer. All default to permissive.
#[derive(Default)]
pub struct Hooks {
    /// Returning `false` stops the loop before the changeset.
    pub admission: Option<AdmissionHook>,
    /// Returning `false` defers the commit; the changeset still counts as
    /// applied and is folded into one combined commit at the end.
    pub commit: Option<CommitHook>,
    /// Called after each checkpoint with entry statuses filled in.
    pub applied: Option<AppliedHook>,
    /// Replaces the automatic conflict policy.
    pub conflict_handler: Option<ConflictHandler>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Why the apply loop stopped before draining the queue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    Vetoed { revision: String },
    Conflict { revision: String, paths: Vec<String> },
}

/// Outcome of one fetch and/or apply run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub fetched: usize,
    pub applied: usize,
    /// Applied without a commit because no entry survived exclusion.
    pub skipped: usize,
    pub commits: usize,
    pub stopped: Option<StopReason>,
}

enum Outcome {
    Applied { committed: usize, skipped: bool },
    Stopped(StopReason),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Database,
    source: Box<dyn SourceAdapter>,
    target: Box<dyn TargetAdapter>,
    options: ReplayOptions,
    formatter: CommitFormatter,
    exclude: ExcludeRules,
    hooks: Hooks,
    state: Mutex<SyncState>,
    cancel: CancelFlag,
    running: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        source: Box<dyn SourceAdapter>,
        target: Box<dyn TargetAdapter>,
        options: ReplayOptions,
    ) -> Self {
        info!(
            source = source.kind(),
            target = target.kind(),
            module = %options.module,
            "initializing sync engine"
        );
        Self {
            db,
            source,
            target,
            formatter: CommitFormatter::new(&options),
            exclude: ExcludeRules::new(&options.exclude),
            options,
            hooks: Hooks::default(),
            state: Mutex::new(SyncState::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share an externally owned cancellation flag, e.g. one set by a
    /// signal handler.
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, to: SyncState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            info!(%from, %to, "state transition");
        }
        if let Err(e) = self.db.set_state(SYNC_STATE_KEY, &to.to_string()) {
            warn!(error = %e, "failed to persist sync state");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<RunningGuard, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }
        Ok(RunningGuard(self.running.clone()))
    }

    fn audit(&self, run_id: &str, revision: Option<&str>, event: ApplyEvent, detail: Option<&str>) {
        if let Err(e) = self.db.insert_apply_log(run_id, revision, event, detail) {
            warn!(error = %e, %event, "failed to write apply log");
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Seed the target with the upstream tree at `revision` (`INITIAL` when
    /// `None`) and set the cursor to the checked out revision.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self, revision: Option<&str>) -> Result<Changeset, SyncError> {
        let _guard = self.lock()?;
        if let Some(cursor) = self.db.cursor()? {
            return Err(SyncError::AlreadyBootstrapped(cursor));
        }
        if self.db.pending_count()? > 0 {
            return Err(SyncError::AlreadyBootstrapped("(pending queue)".into()));
        }
        let revision = revision.unwrap_or(INITIAL);
        let run_id = Uuid::new_v4().to_string();

        let initial = match self.source.checkout_initial(revision).await {
            Ok(cs) => cs,
            Err(e) => {
                self.transition(SyncState::Error);
                return Err(SyncError::Initialization(format!(
                    "checkout of {revision} failed: {e}"
                )));
            }
        };
        let imported = async {
            self.target.initialize().await?;
            let message = self
                .formatter
                .format_bootstrap(&self.options.repository, initial.revision());
            self.target
                .commit(initial.date(), initial.author(), &message, &[".".to_string()])
                .await?;
            for tag in initial.tags() {
                self.target.tag(tag).await?;
            }
            Ok::<(), crate::errors::TargetError>(())
        }
        .await;
        if let Err(e) = imported {
            self.transition(SyncState::Error);
            return Err(SyncError::Initialization(e.to_string()));
        }

        self.db.set_cursor(initial.revision())?;
        self.audit(&run_id, Some(initial.revision()), ApplyEvent::Bootstrap, None);
        self.transition(SyncState::Idle);
        info!(revision = initial.revision(), "bootstrap completed");
        Ok(initial)
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Queue upstream changesets after the cursor. A non-empty queue is
    /// resumed in place and nothing new is fetched. Returns the number of
    /// changesets queued.
    pub async fn fetch(&self) -> Result<usize, SyncError> {
        let _guard = self.lock()?;
        self.fetch_locked(&Uuid::new_v4().to_string()).await
    }

    async fn fetch_locked(&self, run_id: &str) -> Result<usize, SyncError> {
        if !self.db.is_bootstrapped()? {
            return Err(SyncError::NotBootstrapped);
        }
        let queued = self.db.pending_count()?;
        if queued > 0 {
            info!(queued, "resuming pending changesets");
            self.transition(SyncState::Pending);
            return Ok(0);
        }

        self.transition(SyncState::Fetching);
        let cursor = self.db.cursor()?;
        let changesets = match self.source.fetch_changesets_since(cursor.as_deref()).await {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, ?cursor, "fetch failed");
                self.transition(SyncState::Error);
                return Err(SyncError::Fetch(e));
            }
        };

        let count = self.db.push_pending(&changesets)?;
        if count == 0 {
            debug!(?cursor, "upstream has nothing new");
            self.transition(SyncState::Idle);
        } else {
            let detail = format!("{count} changesets after {}", cursor.as_deref().unwrap_or("-"));
            self.audit(run_id, None, ApplyEvent::Fetched, Some(&detail));
            self.transition(SyncState::Pending);
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Apply loop
    // -----------------------------------------------------------------------

    /// Drain the pending queue.
    pub async fn apply_pending(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.lock()?;
        let mut report = SyncReport {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };
        self.apply_locked(&mut report).await?;
        Ok(report)
    }

    /// Fetch, then apply everything pending.
    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.lock()?;
        let mut report = SyncReport {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };
        report.fetched = self.fetch_locked(&report.run_id).await?;
        self.apply_locked(&mut report).await?;
        info!(
            fetched = report.fetched,
            applied = report.applied,
            commits = report.commits,
            "sync cycle completed"
        );
        Ok(report)
    }

    async fn apply_locked(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let mut deferred: Vec<Changeset> = Vec::new();
        let drained = self.drain_queue(report, &mut deferred).await;

        // Deferred changesets are already checkpointed, so they are committed
        // however the loop ended.
        if !deferred.is_empty() {
            match self.commit_deferred(&deferred).await {
                Ok(()) => report.commits += 1,
                Err(e) if drained.is_ok() => return Err(e),
                Err(e) => warn!(error = %e, "combined commit after early stop failed"),
            }
        }
        drained?;
        if report.stopped.is_none() {
            self.transition(SyncState::Done);
        }
        Ok(())
    }

    async fn drain_queue(
        &self,
        report: &mut SyncReport,
        deferred: &mut Vec<Changeset>,
    ) -> Result<(), SyncError> {
        while let Some(pending) = self.db.next_pending()? {
            if self.is_cancelled() {
                return self.cancelled(pending.changeset.revision());
            }
            self.transition(SyncState::Applying);

            let result = self.apply_one(&pending, &report.run_id, deferred).await;
            match result {
                Ok(Outcome::Applied { committed, skipped }) => {
                    report.applied += 1;
                    report.commits += committed;
                    report.skipped += usize::from(skipped);
                    self.transition(SyncState::Pending);
                }
                Ok(Outcome::Stopped(reason)) => {
                    info!(?reason, "apply loop stopped");
                    report.stopped = Some(reason);
                    self.transition(SyncState::Aborted);
                    return Ok(());
                }
                Err(SyncError::Apply {
                    revision,
                    changeset,
                    source,
                }) => {
                    error!(%changeset, error = %source, "failed to apply changeset");
                    self.audit(
                        &report.run_id,
                        Some(&revision),
                        ApplyEvent::Failed,
                        Some(&source.to_string()),
                    );
                    self.transition(SyncState::Error);
                    return Err(SyncError::Apply {
                        revision,
                        changeset,
                        source,
                    });
                }
                Err(SyncError::Cancelled(revision)) => return self.cancelled(&revision),
                Err(e) => {
                    self.transition(SyncState::Error);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn cancelled(&self, revision: &str) -> Result<(), SyncError> {
        warn!(revision, "cancellation requested, stopping before checkpoint");
        self.transition(SyncState::Aborted);
        Err(SyncError::Cancelled(revision.to_string()))
    }

    /// Apply one queued changeset up to and including its checkpoint.
    async fn apply_one(
        &self,
        pending: &PendingChangeset,
        run_id: &str,
        deferred: &mut Vec<Changeset>,
    ) -> Result<Outcome, SyncError> {
        let changeset = &pending.changeset;
        let revision = changeset.revision();
        let fail = |source: CoreError| SyncError::Apply {
            revision: revision.to_string(),
            changeset: changeset.to_string(),
            source: Box::new(source),
        };

        if let Some(admit) = &self.hooks.admission {
            if !admit(changeset) {
                info!(revision, "changeset vetoed by admission hook");
                return Ok(Outcome::Stopped(StopReason::Vetoed {
                    revision: revision.to_string(),
                }));
            }
        }

        let mut conflicts = self
            .source
            .apply_changeset(changeset)
            .await
            .map_err(|e| fail(e.into()))?;
        conflicts.sort();
        conflicts.dedup();
        if !conflicts.is_empty() {
            if let Some(stop) = self
                .handle_conflicts(changeset, &conflicts, run_id)
                .await
                .map_err(fail)?
            {
                return Ok(Outcome::Stopped(stop));
            }
        }

        let filtered = self.exclude.apply(changeset);
        let skipped = filtered.is_empty();
        if skipped {
            debug!(revision, "no entries left after exclusion, skipping replay");
        } else {
            let mut target_conflicts = self
                .target
                .replay(&filtered)
                .await
                .map_err(|e| fail(e.into()))?;
            target_conflicts.retain(|path| !conflicts.contains(path));
            if !target_conflicts.is_empty() {
                target_conflicts.sort();
                target_conflicts.dedup();
                if let Some(stop) = self
                    .handle_conflicts(changeset, &target_conflicts, run_id)
                    .await
                    .map_err(fail)?
                {
                    return Ok(Outcome::Stopped(stop));
                }
                conflicts.extend(target_conflicts);
                conflicts.sort();
            }
        }

        let defer = self.options.delayed_commit
            || self
                .hooks
                .commit
                .as_ref()
                .is_some_and(|allow| !allow(changeset));
        let mut committed = 0;
        if !skipped && !defer {
            // deferred changesets precede this one in history
            if !deferred.is_empty() {
                self.commit_deferred(deferred).await?;
                deferred.clear();
                committed += 1;
            }
            let message = self.formatter.format(&filtered);
            self.target
                .commit(filtered.date(), filtered.author(), &message, &commit_paths(&[&filtered]))
                .await
                .map_err(|e| fail(e.into()))?;
            for tag in filtered.tags() {
                self.target.tag(tag).await.map_err(|e| fail(e.into()))?;
            }
            committed += 1;
        }

        // deferred changesets honour cancellation at the top of the loop
        if !defer && self.is_cancelled() {
            return Err(SyncError::Cancelled(revision.to_string()));
        }
        self.db
            .checkpoint(pending.seq, revision)
            .map_err(|e| fail(e.into()))?;
        if defer && !skipped {
            debug!(revision, "commit deferred");
            deferred.push(filtered.clone());
        }
        self.audit(run_id, Some(revision), ApplyEvent::Applied, None);
        info!(revision, committed, "changeset applied");

        if let Some(applied) = &self.hooks.applied {
            applied(&filtered.with_status(&conflicts));
        }
        Ok(Outcome::Applied { committed, skipped })
    }

    /// `Ok(None)` means replay may go on; `Ok(Some(_))` pauses the loop.
    async fn handle_conflicts(
        &self,
        changeset: &Changeset,
        conflicts: &[String],
        run_id: &str,
    ) -> Result<Option<StopReason>, CoreError> {
        let revision = changeset.revision();
        self.transition(SyncState::Conflict);
        warn!(revision, paths = %conflicts.join(" "), "conflicts after replay");
        self.audit(run_id, Some(revision), ApplyEvent::Conflict, Some(&conflicts.join(" ")));

        let decision = match &self.hooks.conflict_handler {
            Some(handler) => handler(&changeset.with_status(conflicts), conflicts),
            None => {
                if self.source.resolve_conflicts(changeset, conflicts).await? {
                    ConflictDecision::Continue
                } else {
                    ConflictDecision::Abort
                }
            }
        };
        match decision {
            ConflictDecision::Continue => {
                self.transition(SyncState::Applying);
                Ok(None)
            }
            ConflictDecision::Abort => Ok(Some(StopReason::Conflict {
                revision: revision.to_string(),
                paths: conflicts.to_vec(),
            })),
        }
    }

    async fn commit_deferred(&self, deferred: &[Changeset]) -> Result<(), SyncError> {
        let Some(combined) = self
            .formatter
            .format_combined(deferred, self.options.concatenate_logs)
        else {
            return Ok(());
        };
        let refs: Vec<&Changeset> = deferred.iter().collect();
        let last = deferred.last().map(|cs| cs.revision().to_string()).unwrap_or_default();
        let result = async {
            self.target
                .commit(combined.date, &combined.author, &combined.message, &commit_paths(&refs))
                .await?;
            for tag in deferred.iter().flat_map(|cs| cs.tags()) {
                self.target.tag(tag).await?;
            }
            Ok::<(), crate::errors::TargetError>(())
        }
        .await;
        if let Err(e) = result {
            error!(error = %e, count = deferred.len(), "combined commit failed");
            self.transition(SyncState::Error);
            return Err(SyncError::Apply {
                revision: last,
                changeset: deferred
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
                source: Box::new(e.into()),
            });
        }
        info!(count = deferred.len(), "combined commit created");
        Ok(())
    }
}

/// Every path a commit must record: entry names plus rename sources.
fn commit_paths(changesets: &[&Changeset]) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for cs in changesets {
        for entry in cs.entries() {
            paths.insert(entry.name().to_string());
            if let Some(old) = entry.old_name() {
                paths.insert(old.to_string());
            }
        }
    }
    paths.into_iter().collect()
}

/// Clears the running flag on drop.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Entry;
    use chrono::Utc;

    #[test]
    fn test_state_display_roundtrip() {
        for state in [
            SyncState::Idle,
            SyncState::Fetching,
            SyncState::Pending,
            SyncState::Applying,
            SyncState::Conflict,
            SyncState::Done,
            SyncState::Aborted,
            SyncState::Error,
        ] {
            assert_eq!(SyncState::from_str_val(&state.to_string()), state);
        }
        assert_eq!(SyncState::from_str_val("bogus"), SyncState::Idle);
    }

    #[test]
    fn test_commit_paths_include_rename_sources() {
        let a = Changeset::new(
            "1",
            Utc::now(),
            "a",
            "",
            vec![Entry::renamed("new.c", "old.c"), Entry::updated("x.c")],
            false,
        );
        let b = Changeset::new("2", Utc::now(), "a", "", vec![Entry::updated("x.c")], false);
        assert_eq!(commit_paths(&[&a, &b]), vec!["new.c", "old.c", "x.c"]);
    }
}
