//! Upstream (source) adapters.
//!
//! One implementation per backend. Each adapter shells out to the backend's
//! command-line tool, feeds the output through the matching log parser and
//! updates the shared working directory to a given changeset.

pub mod cvs;
pub mod darcs;
pub mod svn;

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::changeset::Changeset;
use crate::config::{Config, SourceKind};
use crate::errors::SourceError;

pub use cvs::CvsSource;
pub use darcs::DarcsSource;
pub use svn::SvnSource;

/// Revision keyword for the first upstream revision.
pub const INITIAL: &str = "INITIAL";
/// Revision keyword for the latest upstream revision.
pub const HEAD: &str = "HEAD";

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Backend name for logs.
    fn kind(&self) -> &str;

    /// Changesets strictly after `cursor`, oldest first. `None` means
    /// everything after the current working-directory state.
    async fn fetch_changesets_since(
        &self,
        cursor: Option<&str>,
    ) -> Result<Vec<Changeset>, SourceError>;

    /// Populate the working directory at `revision` (`INITIAL`, `HEAD` or a
    /// backend token) and describe the resulting snapshot.
    async fn checkout_initial(&self, revision: &str) -> Result<Changeset, SourceError>;

    /// Bring the working directory to `changeset`. Returns conflicting paths.
    async fn apply_changeset(&self, changeset: &Changeset) -> Result<Vec<String>, SourceError>;

    /// Automatic conflict policy. `Ok(true)` means the conflicts are gone
    /// and replay may continue; the default leaves them to the operator.
    async fn resolve_conflicts(
        &self,
        _changeset: &Changeset,
        _conflicts: &[String],
    ) -> Result<bool, SourceError> {
        Ok(false)
    }
}

/// Build the adapter selected by `[source] kind`.
pub fn build_source(config: &Config) -> Box<dyn SourceAdapter> {
    let root = config.project.root.clone();
    let refill = config.replay.refill_changelogs;
    match config.source.kind {
        SourceKind::Svn => Box::new(SvnSource::new(
            &config.source,
            root,
            refill,
            config.retry_policy(),
        )),
        SourceKind::Darcs => Box::new(DarcsSource::new(&config.source, root, refill)),
        SourceKind::Cvs => Box::new(CvsSource::new(
            &config.source,
            root,
            refill,
            config.coalesce_threshold(),
        )),
    }
}

/// Run a backend command and return its stdout.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<String, SourceError> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(cmd = %command_line(program, args), "running command");
    let output = cmd.output().await.map_err(|e| spawn_error(program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code().unwrap_or(-1);
        warn!(program, exit_code, %stderr, "command failed");
        return Err(SourceError::CommandFailed {
            command: command_line(program, args),
            exit_code,
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) fn spawn_error(program: &str, e: std::io::Error) -> SourceError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SourceError::BinaryNotFound(program.to_string())
    } else {
        SourceError::IoError(e)
    }
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    format!("{} {}", program, args.join(" "))
}

/// Paths reported on `C path` lines by `svn update` and `cvs update`.
pub(crate) fn conflict_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("C "))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

/// Exit status 1 from a backend marks a transient failure worth retrying.
pub(crate) fn is_transient(err: &SourceError) -> bool {
    matches!(err, SourceError::CommandFailed { exit_code: 1, .. })
}
