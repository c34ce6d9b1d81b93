//! Integration tests for the replay engine.
//!
//! The engine is driven with scripted in-process adapters: the source serves
//! a fixed upstream history and the target records every call, so the tests
//! can check exactly what was replayed, committed and checkpointed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use vcsmirror_core::commit_format::CommitMessage;
use vcsmirror_core::config::ReplayOptions;
use vcsmirror_core::engine::StopReason;
use vcsmirror_core::errors::{SourceError, SyncError, TargetError};
use vcsmirror_core::{
    Changeset, ConflictDecision, Database, Entry, EntryStatus, Hooks, SourceAdapter, SyncEngine,
    SyncState, TargetAdapter,
};

// ===========================================================================
// Scripted adapters
// ===========================================================================

type Journal = Arc<Mutex<Vec<String>>>;

fn date(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
}

fn changeset(rev: u32, author: &str, entries: Vec<Entry>) -> Changeset {
    Changeset::new(
        rev.to_string(),
        date(rev),
        author,
        &format!("change number {rev}"),
        entries,
        false,
    )
}

fn history(n: u32) -> Vec<Changeset> {
    (1..=n)
        .map(|rev| changeset(rev, "alice", vec![Entry::updated(format!("file{rev}.txt"))]))
        .collect()
}

#[derive(Default)]
struct SourceScript {
    upstream: Vec<Changeset>,
    fail_fetch: bool,
    conflicts: HashMap<String, Vec<String>>,
    auto_resolve: bool,
}

struct ScriptedSource {
    script: SourceScript,
    applied: Journal,
    fetches: Journal,
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn fetch_changesets_since(
        &self,
        cursor: Option<&str>,
    ) -> Result<Vec<Changeset>, SourceError> {
        self.fetches
            .lock()
            .unwrap()
            .push(cursor.unwrap_or("-").to_string());
        if self.script.fail_fetch {
            return Err(SourceError::CommandFailed {
                command: "scripted log".into(),
                exit_code: 1,
                stderr: "connection refused".into(),
            });
        }
        let since: u32 = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        Ok(self
            .script
            .upstream
            .iter()
            .filter(|cs| cs.revision().parse::<u32>().unwrap() > since)
            .cloned()
            .collect())
    }

    async fn checkout_initial(&self, revision: &str) -> Result<Changeset, SourceError> {
        let rev = if revision == "INITIAL" { "0" } else { revision };
        Ok(Changeset::new(rev, date(0), "importer", "", vec![], false))
    }

    async fn apply_changeset(&self, changeset: &Changeset) -> Result<Vec<String>, SourceError> {
        self.applied
            .lock()
            .unwrap()
            .push(changeset.revision().to_string());
        Ok(self
            .script
            .conflicts
            .get(changeset.revision())
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_conflicts(
        &self,
        _changeset: &Changeset,
        _conflicts: &[String],
    ) -> Result<bool, SourceError> {
        Ok(self.script.auto_resolve)
    }
}

struct ScriptedTarget {
    journal: Journal,
    fail_replay_at: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl TargetAdapter for ScriptedTarget {
    fn kind(&self) -> &str {
        "recording"
    }

    async fn initialize(&self) -> Result<(), TargetError> {
        self.journal.lock().unwrap().push("initialize".into());
        Ok(())
    }

    async fn replay(&self, changeset: &Changeset) -> Result<Vec<String>, TargetError> {
        if self.fail_replay_at.lock().unwrap().as_deref() == Some(changeset.revision()) {
            return Err(TargetError::InitializationFailed("disk full".into()));
        }
        self.journal
            .lock()
            .unwrap()
            .push(format!("replay {}", changeset.revision()));
        Ok(Vec::new())
    }

    async fn commit(
        &self,
        _date: DateTime<Utc>,
        author: &str,
        message: &CommitMessage,
        entries: &[String],
    ) -> Result<(), TargetError> {
        self.journal.lock().unwrap().push(format!(
            "commit [{author}] {} ({})",
            message.patch_name,
            entries.join(",")
        ));
        Ok(())
    }

    async fn tag(&self, name: &str) -> Result<(), TargetError> {
        self.journal.lock().unwrap().push(format!("tag {name}"));
        Ok(())
    }
}

struct Harness {
    engine: SyncEngine,
    journal: Journal,
    applied: Journal,
    fetches: Journal,
    fail_replay_at: Arc<Mutex<Option<String>>>,
}

impl Harness {
    fn new(script: SourceScript, options: ReplayOptions, hooks: Hooks) -> Self {
        Self::with_db(db(), script, options, hooks)
    }

    fn with_db(db: Database, script: SourceScript, options: ReplayOptions, hooks: Hooks) -> Self {
        let journal = Journal::default();
        let applied = Journal::default();
        let fetches = Journal::default();
        let fail_replay_at = Arc::new(Mutex::new(None));
        let source = ScriptedSource {
            script,
            applied: applied.clone(),
            fetches: fetches.clone(),
        };
        let target = ScriptedTarget {
            journal: journal.clone(),
            fail_replay_at: fail_replay_at.clone(),
        };
        let engine =
            SyncEngine::new(db, Box::new(source), Box::new(target), options).with_hooks(hooks);
        Self {
            engine,
            journal,
            applied,
            fetches,
            fail_replay_at,
        }
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn commits(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|line| line.starts_with("commit"))
            .collect()
    }

    fn cursor(&self) -> Option<String> {
        self.engine.db().cursor().unwrap()
    }

    fn pending_revisions(&self) -> Vec<String> {
        self.engine
            .db()
            .pending()
            .unwrap()
            .into_iter()
            .map(|p| p.changeset.revision().to_string())
            .collect()
    }
}

fn db() -> Database {
    Database::in_memory().unwrap()
}

fn options() -> ReplayOptions {
    ReplayOptions {
        module: "/trunk".into(),
        repository: "file:///srv/svn".into(),
        patch_name_format: "{module}: changeset {revision}".into(),
        ..ReplayOptions::default()
    }
}

fn upstream(n: u32) -> SourceScript {
    SourceScript {
        upstream: history(n),
        ..Default::default()
    }
}

// ===========================================================================
// Bootstrap
// ===========================================================================

#[tokio::test]
async fn test_bootstrap_imports_tree_and_sets_cursor() {
    let h = Harness::new(upstream(3), options(), Hooks::default());
    let initial = h.engine.bootstrap(None).await.unwrap();
    assert_eq!(initial.revision(), "0");
    assert_eq!(h.cursor().as_deref(), Some("0"));
    assert_eq!(
        h.journal(),
        vec![
            "initialize".to_string(),
            "commit [importer] Tailorization of /trunk (.)".to_string(),
        ]
    );

    let again = h.engine.bootstrap(None).await;
    assert!(matches!(again, Err(SyncError::AlreadyBootstrapped(rev)) if rev == "0"));
}

#[tokio::test]
async fn test_fetch_requires_bootstrap() {
    let h = Harness::new(upstream(3), options(), Hooks::default());
    assert!(matches!(h.engine.fetch().await, Err(SyncError::NotBootstrapped)));
    assert!(h.fetches.lock().unwrap().is_empty());
}

// ===========================================================================
// Apply loop
// ===========================================================================

#[tokio::test]
async fn test_cycle_replays_in_order_and_checkpoints() {
    let h = Harness::new(upstream(3), options(), Hooks::default());
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.applied, 3);
    assert_eq!(report.commits, 3);
    assert!(report.stopped.is_none());

    assert_eq!(
        h.journal(),
        vec![
            "replay 1",
            "commit [alice] /trunk: changeset 1 (file1.txt)",
            "replay 2",
            "commit [alice] /trunk: changeset 2 (file2.txt)",
            "replay 3",
            "commit [alice] /trunk: changeset 3 (file3.txt)",
        ]
    );
    assert_eq!(h.cursor().as_deref(), Some("3"));
    assert!(h.pending_revisions().is_empty());
    assert_eq!(h.engine.state(), SyncState::Done);

    // Nothing new upstream: the next cycle fetches from the cursor and idles.
    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(h.fetches.lock().unwrap().last().map(String::as_str), Some("3"));
}

#[tokio::test]
async fn test_apply_failure_leaves_queue_and_resume_is_exactly_once() {
    let h = Harness::new(upstream(5), options(), Hooks::default());
    h.engine.db().set_cursor("0").unwrap();
    *h.fail_replay_at.lock().unwrap() = Some("3".into());

    let err = h.engine.run_cycle().await.unwrap_err();
    match err {
        SyncError::Apply {
            revision,
            changeset,
            ..
        } => {
            assert_eq!(revision, "3");
            assert!(changeset.contains("Revision: 3"));
            assert!(changeset.contains("file3.txt"));
        }
        other => panic!("expected apply failure, got {other:?}"),
    }
    assert_eq!(h.cursor().as_deref(), Some("2"));
    assert_eq!(h.pending_revisions(), vec!["3", "4", "5"]);
    assert_eq!(h.engine.state(), SyncState::Error);

    // Restart: the queue is resumed in place, nothing is fetched again.
    *h.fail_replay_at.lock().unwrap() = None;
    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(report.applied, 3);
    assert_eq!(h.fetches.lock().unwrap().len(), 1);

    let committed: Vec<String> = h.commits();
    assert_eq!(committed.len(), 5);
    for (i, line) in committed.iter().enumerate() {
        assert!(line.contains(&format!("changeset {}", i + 1)), "{line}");
    }
    assert_eq!(h.cursor().as_deref(), Some("5"));
}

#[tokio::test]
async fn test_resume_after_crash_between_commit_and_checkpoint() {
    let db = db();
    db.set_cursor("0").unwrap();
    db.push_pending(&history(4)).unwrap();
    // Changesets 1 and 2 were checkpointed before the crash.
    for _ in 0..2 {
        let next = db.next_pending().unwrap().unwrap();
        db.checkpoint(next.seq, next.changeset.revision()).unwrap();
    }

    let h = Harness::with_db(db, upstream(4), options(), Hooks::default());
    let report = h.engine.apply_pending().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(*h.applied.lock().unwrap(), vec!["3", "4"]);
    assert_eq!(h.cursor().as_deref(), Some("4"));
}

#[tokio::test]
async fn test_fetch_failure_leaves_store_untouched() {
    let script = SourceScript {
        upstream: history(2),
        fail_fetch: true,
        ..Default::default()
    };
    let h = Harness::new(script, options(), Hooks::default());
    h.engine.db().set_cursor("7").unwrap();

    let err = h.engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch(SourceError::CommandFailed { .. })));
    assert_eq!(h.cursor().as_deref(), Some("7"));
    assert!(h.pending_revisions().is_empty());
    assert!(h.journal().is_empty());
    assert_eq!(h.engine.state(), SyncState::Error);
}

#[tokio::test]
async fn test_changeset_emptied_by_exclusion_is_not_committed() {
    let script = SourceScript {
        upstream: vec![
            changeset(1, "alice", vec![Entry::added("cache.pyc")]),
            changeset(2, "alice", vec![Entry::added("main.py"), Entry::added("main.pyc")]),
        ],
        ..Default::default()
    };
    let opts = ReplayOptions {
        exclude: vec!["*.pyc".into()],
        ..options()
    };
    let h = Harness::new(script, opts, Hooks::default());
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.commits, 1);
    assert_eq!(
        h.journal(),
        vec!["replay 2", "commit [alice] /trunk: changeset 2 (main.py)"]
    );
    // The source still moved the working copy past both.
    assert_eq!(*h.applied.lock().unwrap(), vec!["1", "2"]);
    assert_eq!(h.cursor().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_admission_veto_stops_loop() {
    let hooks = Hooks {
        admission: Some(Box::new(|cs: &Changeset| cs.revision() != "2")),
        ..Default::default()
    };
    let h = Harness::new(upstream(3), options(), hooks);
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(
        report.stopped,
        Some(StopReason::Vetoed {
            revision: "2".into()
        })
    );
    assert_eq!(h.cursor().as_deref(), Some("1"));
    assert_eq!(h.pending_revisions(), vec!["2", "3"]);
}

// ===========================================================================
// Conflicts
// ===========================================================================

fn conflicting(auto_resolve: bool) -> SourceScript {
    SourceScript {
        upstream: vec![
            changeset(1, "alice", vec![Entry::updated("a.txt")]),
            changeset(2, "bob", vec![Entry::updated("a.txt"), Entry::updated("b.txt")]),
            changeset(3, "alice", vec![Entry::updated("c.txt")]),
        ],
        conflicts: HashMap::from([("2".to_string(), vec!["./a.txt".to_string()])]),
        auto_resolve,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_unresolved_conflict_pauses_with_changeset_queued() {
    let h = Harness::new(conflicting(false), options(), Hooks::default());
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(
        report.stopped,
        Some(StopReason::Conflict {
            revision: "2".into(),
            paths: vec!["./a.txt".into()],
        })
    );
    assert_eq!(h.engine.state(), SyncState::Aborted);
    assert_eq!(h.cursor().as_deref(), Some("1"));
    assert_eq!(h.pending_revisions(), vec!["2", "3"]);
    assert_eq!(h.commits().len(), 1);

    let log = h.engine.db().list_apply_log(10).unwrap();
    assert!(log
        .iter()
        .any(|e| e.event == "conflict" && e.revision.as_deref() == Some("2")));
}

#[tokio::test]
async fn test_automatic_conflict_policy_continues() {
    let seen: Arc<Mutex<Vec<Changeset>>> = Arc::default();
    let sink = seen.clone();
    let hooks = Hooks {
        applied: Some(Box::new(move |cs: &Changeset| sink.lock().unwrap().push(cs.clone()))),
        ..Default::default()
    };
    let h = Harness::new(conflicting(true), options(), hooks);
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert!(report.stopped.is_none());
    assert_eq!(report.applied, 3);
    assert_eq!(h.cursor().as_deref(), Some("3"));

    let seen = seen.lock().unwrap();
    let second = &seen[1];
    assert_eq!(second.entries()[0].status(), Some(EntryStatus::Conflict));
    assert_eq!(second.entries()[1].status(), Some(EntryStatus::Applied));
}

#[tokio::test]
async fn test_conflict_handler_overrides_source_policy() {
    let hooks = Hooks {
        conflict_handler: Some(Box::new(|_cs: &Changeset, paths: &[String]| {
            assert_eq!(paths, ["./a.txt".to_string()]);
            ConflictDecision::Continue
        })),
        ..Default::default()
    };
    let h = Harness::new(conflicting(false), options(), hooks);
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert!(report.stopped.is_none());
    assert_eq!(h.cursor().as_deref(), Some("3"));
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn test_cancellation_during_conflict_pause_skips_checkpoint() {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = flag.clone();
    let hooks = Hooks {
        conflict_handler: Some(Box::new(move |_cs: &Changeset, _paths: &[String]| {
            raised.store(true, Ordering::SeqCst);
            ConflictDecision::Continue
        })),
        ..Default::default()
    };
    let db = db();
    let h = Harness::with_db(db, conflicting(false), options(), hooks);
    let engine = h.engine;
    let engine = engine.with_cancel_flag(flag.clone());
    engine.db().set_cursor("0").unwrap();

    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled(rev) if rev == "2"));
    assert_eq!(engine.db().cursor().unwrap().as_deref(), Some("1"));
    assert_eq!(engine.db().pending_count().unwrap(), 2);
    assert_eq!(engine.state(), SyncState::Aborted);
}

#[tokio::test]
async fn test_cancellation_between_changesets() {
    let h = Harness::new(upstream(3), options(), Hooks::default());
    let flag = h.engine.cancel_flag();
    let hooks = Hooks {
        applied: Some(Box::new(move |_cs: &Changeset| flag.store(true, Ordering::SeqCst))),
        ..Default::default()
    };
    let engine = h.engine.with_hooks(hooks);
    engine.db().set_cursor("0").unwrap();

    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled(rev) if rev == "2"));
    assert_eq!(engine.db().cursor().unwrap().as_deref(), Some("1"));
    assert_eq!(engine.db().pending_count().unwrap(), 2);
}

// ===========================================================================
// Delayed commits
// ===========================================================================

#[tokio::test]
async fn test_delayed_commit_folds_into_one() {
    let script = SourceScript {
        upstream: vec![
            changeset(1, "alice", vec![Entry::updated("a.txt")]),
            changeset(2, "bob", vec![Entry::renamed("c.txt", "b.txt")]),
            changeset(3, "alice", vec![Entry::updated("a.txt")]),
        ],
        ..Default::default()
    };
    let opts = ReplayOptions {
        delayed_commit: true,
        ..options()
    };
    let h = Harness::new(script, opts, Hooks::default());
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.applied, 3);
    assert_eq!(report.commits, 1);
    assert_eq!(
        h.commits(),
        vec![
            "commit [alice, bob] Merged 3 changesets from 2024-03-01 12:01:00 UTC to 2024-03-01 12:03:00 UTC (a.txt,b.txt,c.txt)"
                .to_string()
        ]
    );
    assert_eq!(h.cursor().as_deref(), Some("3"));
}

#[tokio::test]
async fn test_commit_hook_defers_selected_changesets() {
    let hooks = Hooks {
        commit: Some(Box::new(|cs: &Changeset| cs.revision() == "3")),
        ..Default::default()
    };
    let h = Harness::new(upstream(3), options(), hooks);
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.commits, 2);
    let commits = h.commits();
    assert!(commits[0].contains("Merged 2 changesets"));
    assert_eq!(commits[1], "commit [alice] /trunk: changeset 3 (file3.txt)");
    assert_eq!(h.cursor().as_deref(), Some("3"));
}

#[tokio::test]
async fn test_deferred_changesets_committed_when_veto_stops_loop() {
    let hooks = Hooks {
        admission: Some(Box::new(|cs: &Changeset| cs.revision() != "3")),
        ..Default::default()
    };
    let opts = ReplayOptions {
        delayed_commit: true,
        ..options()
    };
    let h = Harness::new(upstream(3), opts, hooks);
    h.engine.db().set_cursor("0").unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.commits, 1);
    assert_eq!(
        report.stopped,
        Some(StopReason::Vetoed {
            revision: "3".into()
        })
    );
    assert_eq!(
        h.commits(),
        vec![
            "commit [alice] Merged 2 changesets from 2024-03-01 12:01:00 UTC to 2024-03-01 12:02:00 UTC (file1.txt,file2.txt)"
                .to_string()
        ]
    );
    assert_eq!(h.cursor().as_deref(), Some("2"));
    assert_eq!(h.pending_revisions(), vec!["3"]);
    assert_eq!(h.engine.state(), SyncState::Aborted);
}

#[tokio::test]
async fn test_deferred_changesets_committed_on_cancellation() {
    let opts = ReplayOptions {
        delayed_commit: true,
        ..options()
    };
    let h = Harness::new(upstream(3), opts, Hooks::default());
    let flag = h.engine.cancel_flag();
    let hooks = Hooks {
        applied: Some(Box::new(move |cs: &Changeset| {
            if cs.revision() == "2" {
                flag.store(true, Ordering::SeqCst);
            }
        })),
        ..Default::default()
    };
    let engine = h.engine.with_hooks(hooks);
    engine.db().set_cursor("0").unwrap();

    let err = engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled(rev) if rev == "3"));
    assert_eq!(engine.db().cursor().unwrap().as_deref(), Some("2"));
    assert_eq!(engine.db().pending_count().unwrap(), 1);
    let commits: Vec<String> = h
        .journal
        .lock()
        .unwrap()
        .iter()
        .filter(|line| line.starts_with("commit"))
        .cloned()
        .collect();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].contains("Merged 2 changesets"));
}

#[tokio::test]
async fn test_tags_follow_their_commit() {
    let script = SourceScript {
        upstream: vec![
            changeset(1, "alice", vec![Entry::updated("a.txt")]).with_tags(["v1.0"]),
        ],
        ..Default::default()
    };
    let h = Harness::new(script, options(), Hooks::default());
    h.engine.db().set_cursor("0").unwrap();
    h.engine.run_cycle().await.unwrap();
    assert_eq!(
        h.journal(),
        vec![
            "replay 1",
            "commit [alice] /trunk: changeset 1 (a.txt)",
            "tag v1.0",
        ]
    );
}
