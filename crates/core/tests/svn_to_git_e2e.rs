//! End-to-end replay of a real Subversion history into git.
//!
//! Uses a local repository created with `svnadmin create` (file:// URL), a
//! real SQLite state store and a real git repository. Skips when `svn` or
//! `svnadmin` is not installed.

use std::path::Path;
use std::process::{Command, Stdio};

use tempfile::TempDir;

use vcsmirror_core::config::Config;
use vcsmirror_core::db::Database;
use vcsmirror_core::{build_source, build_target, SyncEngine};

// ===========================================================================
// Helpers
// ===========================================================================

fn svn_available() -> bool {
    ["svn", "svnadmin"].iter().all(|bin| {
        Command::new(bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn svn(args: &[&str]) {
    let output = Command::new("svn")
        .args(args)
        .arg("--non-interactive")
        .output()
        .expect("failed to run svn");
    assert!(
        output.status.success(),
        "svn {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create_svn_repo(dir: &Path) -> String {
    let repo_dir = dir.join("svn_repo");
    let status = Command::new("svnadmin")
        .args(["create", repo_dir.to_str().unwrap()])
        .status()
        .expect("failed to run svnadmin create");
    assert!(status.success(), "svnadmin create failed");
    format!("file://{}", repo_dir.display())
}

fn write_config(dir: &Path, url: &str, root: &Path) -> Config {
    let path = dir.join("vcsmirror.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[project]
name = "e2e"
root = "{}"

[source]
kind = "svn"
repository = "{}"
module = "/trunk"

[replay]
patch_name_format = "[{{revision}}] {{firstlogline}}"
"#,
            root.display(),
            url
        ),
    )
    .unwrap();
    Config::load_and_validate(&path).expect("config should load")
}

fn head_files(root: &Path) -> Vec<String> {
    let repo = git2::Repository::open(root).unwrap();
    let tree = repo.head().unwrap().peel_to_tree().unwrap();
    let mut files = Vec::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            files.push(format!("{dir}{}", entry.name().unwrap()));
        }
        git2::TreeWalkResult::Ok
    })
    .unwrap();
    files.sort();
    files
}

fn commit_subjects(root: &Path) -> Vec<String> {
    let repo = git2::Repository::open(root).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_head().unwrap();
    walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)
        .unwrap();
    walk.map(|oid| {
        let commit = repo.find_commit(oid.unwrap()).unwrap();
        commit.summary().unwrap_or("").to_string()
    })
    .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_svn_history_replays_into_git() {
    if !svn_available() {
        eprintln!("skipping: svn/svnadmin not installed");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let url = create_svn_repo(tmp.path());

    // r1: layout, r2: a.txt, r3: dir/b.txt, r4: a.txt -> c.txt
    svn(&["mkdir", "-m", "Create trunk", &format!("{url}/trunk")]);
    let wc = tmp.path().join("author_wc");
    let wc_str = wc.to_str().unwrap().to_string();
    svn(&["checkout", &format!("{url}/trunk"), &wc_str]);

    std::fs::write(wc.join("a.txt"), "alpha\n").unwrap();
    svn(&["add", wc.join("a.txt").to_str().unwrap()]);
    svn(&["commit", "-m", "Add a", &wc_str]);

    std::fs::create_dir_all(wc.join("dir")).unwrap();
    std::fs::write(wc.join("dir/b.txt"), "beta\n").unwrap();
    svn(&["add", wc.join("dir").to_str().unwrap()]);
    svn(&["commit", "-m", "Add dir with b", &wc_str]);

    svn(&[
        "mv",
        wc.join("a.txt").to_str().unwrap(),
        wc.join("c.txt").to_str().unwrap(),
    ]);
    svn(&["commit", "-m", "Rename a to c", &wc_str]);

    let root = tmp.path().join("mirror");
    let config = write_config(tmp.path(), &url, &root);
    std::fs::create_dir_all(&root).unwrap();
    let db = Database::open(config.state_path()).unwrap();

    let engine = SyncEngine::new(
        db,
        build_source(&config),
        build_target(&config),
        config.replay_options(),
    );

    let initial = engine.bootstrap(None).await.unwrap();
    assert_eq!(initial.revision(), "1");

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.applied, 3);
    assert!(report.stopped.is_none());
    assert_eq!(engine.db().cursor().unwrap().as_deref(), Some("4"));

    assert_eq!(head_files(&root), vec!["c.txt", "dir/b.txt"]);
    assert_eq!(
        commit_subjects(&root),
        vec![
            "Tailorization of /trunk",
            "[2] Add a",
            "[3] Add dir with b",
            "[4] Rename a to c",
        ]
    );

    // Nothing new upstream.
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(commit_subjects(&root).len(), 4);
}
