//! Subversion source adapter.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{
    command_line, conflict_lines, is_transient, run_command, spawn_error, SourceAdapter, HEAD,
    INITIAL,
};
use crate::changeset::Changeset;
use crate::config::SourceConfig;
use crate::errors::SourceError;
use crate::parser::svn::filter_badchars;
use crate::parser::{IncrementalParser, SvnLogParser, CHUNK_SIZE};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SvnSource {
    repository: String,
    module: String,
    root: PathBuf,
    ignore_externals: bool,
    filter_badchars: bool,
    refill: bool,
    retry: RetryPolicy,
}

impl SvnSource {
    pub fn new(config: &SourceConfig, root: PathBuf, refill: bool, retry: RetryPolicy) -> Self {
        Self {
            repository: config.repository.trim_end_matches('/').to_string(),
            module: config.module.clone(),
            root,
            ignore_externals: config.ignore_externals,
            filter_badchars: config.filter_badchars,
            refill,
            retry,
        }
    }

    fn module_url(&self) -> String {
        format!("{}{}", self.repository, self.module)
    }

    fn parser(&self) -> SvnLogParser {
        SvnLogParser::new(&self.module, self.refill)
    }

    /// Run `svn log` and feed its stdout to the parser chunk by chunk.
    async fn stream_log(&self, args: &[&str]) -> Result<Vec<Changeset>, SourceError> {
        let mut cmd = Command::new("svn");
        cmd.args(args)
            .arg("--non-interactive")
            .env("TZ", "UTC0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(cmd = %command_line("svn", args), "streaming svn log");

        let mut child = cmd.spawn().map_err(|e| spawn_error("svn", e))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::IoError(std::io::ErrorKind::BrokenPipe.into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SourceError::IoError(std::io::ErrorKind::BrokenPipe.into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        let mut parser = self.parser();
        let mut changesets = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let parsed: Result<(), SourceError> = async {
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let chunk = &mut buf[..n];
                if self.filter_badchars {
                    filter_badchars(chunk);
                }
                changesets.extend(parser.feed(chunk)?);
            }
            Ok(())
        }
        .await;
        if let Err(e) = parsed {
            let _ = child.kill().await;
            return Err(e);
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            if is_past_head(&stderr) {
                debug!("no revisions after cursor");
                return Ok(Vec::new());
            }
            warn!(exit_code, stderr = %stderr.trim(), "svn log failed");
            return Err(SourceError::CommandFailed {
                command: command_line("svn", args),
                exit_code,
                stderr: stderr.trim().to_string(),
            });
        }
        changesets.extend(parser.finish()?);
        Ok(changesets)
    }

    async fn describe(&self, revision: &str, target: &str) -> Result<Changeset, SourceError> {
        let log = run_command(
            "svn",
            &["log", "--verbose", "--xml", "--revision", revision, target],
            Some(&self.root),
        )
        .await?;
        let mut parser = self.parser();
        let mut found = parser.feed(log.as_bytes())?;
        found.extend(parser.finish()?);
        found
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::RevisionNotFound(revision.to_string()))
    }
}

/// `svn log -r N:HEAD` with N past the youngest revision.
fn is_past_head(stderr: &str) -> bool {
    stderr.contains("E160006") || stderr.contains("No such revision")
}

fn parse_cursor(cursor: Option<&str>) -> Result<u64, SourceError> {
    match cursor {
        None => Ok(0),
        Some(rev) => rev
            .trim()
            .parse()
            .map_err(|_| SourceError::RevisionNotFound(rev.to_string())),
    }
}

#[async_trait]
impl SourceAdapter for SvnSource {
    fn kind(&self) -> &str {
        "svn"
    }

    #[instrument(skip(self), fields(url = %self.module_url()))]
    async fn fetch_changesets_since(
        &self,
        cursor: Option<&str>,
    ) -> Result<Vec<Changeset>, SourceError> {
        let since = parse_cursor(cursor)?;
        let range = format!("{}:HEAD", since + 1);
        let url = self.module_url();
        let changesets = self
            .stream_log(&["log", "--verbose", "--xml", "--revision", &range, &url])
            .await?;
        info!(count = changesets.len(), since, "fetched svn changesets");
        Ok(changesets)
    }

    #[instrument(skip(self), fields(url = %self.module_url()))]
    async fn checkout_initial(&self, revision: &str) -> Result<Changeset, SourceError> {
        let url = self.module_url();
        let first = if revision == INITIAL {
            let found = self
                .stream_log(&[
                    "log",
                    "--verbose",
                    "--xml",
                    "--stop-on-copy",
                    "--limit",
                    "1",
                    "--revision",
                    "1:HEAD",
                    &url,
                ])
                .await?;
            Some(
                found
                    .into_iter()
                    .next()
                    .ok_or_else(|| SourceError::RevisionNotFound(INITIAL.to_string()))?,
            )
        } else {
            None
        };
        let checkout_rev = first
            .as_ref()
            .map(|cs| cs.revision().to_string())
            .unwrap_or_else(|| revision.to_string());

        if self.root.join(".svn").exists() {
            debug!(root = %self.root.display(), "working copy exists, not checking out");
        } else {
            let root = self.root.to_string_lossy().to_string();
            let mut args = vec!["checkout", "--quiet", "--non-interactive"];
            if self.ignore_externals {
                args.push("--ignore-externals");
            }
            args.extend(["--revision", checkout_rev.as_str(), url.as_str(), root.as_str()]);
            run_command("svn", &args, None).await?;
            info!(root = %self.root.display(), revision = %checkout_rev, "svn checkout completed");
        }

        match first {
            Some(cs) => Ok(cs),
            None => {
                let rev = if revision == HEAD { "COMMITTED" } else { revision };
                let root = self.root.to_string_lossy().to_string();
                self.describe(rev, &root).await
            }
        }
    }

    #[instrument(skip(self, changeset), fields(revision = %changeset.revision()))]
    async fn apply_changeset(&self, changeset: &Changeset) -> Result<Vec<String>, SourceError> {
        let mut args = vec!["update", "--non-interactive"];
        if self.ignore_externals {
            args.push("--ignore-externals");
        }
        args.extend(["--revision", changeset.revision()]);

        let output = self
            .retry
            .run("svn update", is_transient, |_| {
                run_command("svn", &args, Some(&self.root))
            })
            .await?;

        let conflicts = conflict_lines(&output);
        for path in &conflicts {
            warn!(path, "conflict after svn update");
        }
        debug!(revision = changeset.revision(), "svn working copy updated");
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor(None).unwrap(), 0);
        assert_eq!(parse_cursor(Some("42")).unwrap(), 42);
        assert!(matches!(
            parse_cursor(Some("2004-01-01; x")),
            Err(SourceError::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_past_head_detection() {
        assert!(is_past_head("svn: E160006: No such revision 43"));
        assert!(!is_past_head("svn: E170013: Unable to connect"));
    }

    #[test]
    fn test_module_url() {
        let config = SourceConfig {
            kind: crate::config::SourceKind::Svn,
            repository: "file:///srv/svn/".into(),
            module: "/trunk".into(),
            revision: INITIAL.into(),
            ignore_externals: false,
            filter_badchars: false,
        };
        let source = SvnSource::new(&config, PathBuf::from("/tmp/wc"), true, RetryPolicy::no_retry());
        assert_eq!(source.module_url(), "file:///srv/svn/trunk");
    }
}
