//! Git operations facade: status/diff/log/commit/push against a session's
//! worktree, executed inside the sandbox through the driver.

use std::sync::Arc;

use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::sandbox::{ExecSpec, SandboxRuntime};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    /// Two-column porcelain status (`XY`, or `??` for untracked).
    pub status: String,
    pub staged: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct GitStatus {
    pub branch: String,
    pub ahead: i64,
    pub behind: i64,
    pub files: Vec<FileEntry>,
    pub clean: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub date: String,
    pub message: String,
}

pub struct GitOps {
    runtime: Arc<dyn SandboxRuntime>,
}

impl GitOps {
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self { runtime }
    }

    async fn git(&self, sandbox: &str, workdir: &str, args: &[&str]) -> Result<String> {
        let mut argv = vec!["git", "-C", workdir];
        argv.extend_from_slice(args);
        let output = self.runtime.exec(sandbox, ExecSpec::new(argv)).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_git_exec(&output.stderr, args))
        }
    }

    pub async fn status(&self, sandbox: &str, workdir: &str) -> Result<GitStatus> {
        let raw = self
            .git(sandbox, workdir, &["status", "--porcelain=v2", "--branch"])
            .await?;
        Ok(parse_porcelain_status(&raw))
    }

    pub async fn diff(
        &self,
        sandbox: &str,
        workdir: &str,
        file: Option<&str>,
        staged: bool,
    ) -> Result<String> {
        let mut args = vec!["diff"];
        if staged {
            args.push("--cached");
        }
        if let Some(file) = file {
            args.push("--");
            args.push(file);
        }
        self.git(sandbox, workdir, &args).await
    }

    pub async fn log(
        &self,
        sandbox: &str,
        workdir: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CommitInfo>> {
        let limit_arg = limit.to_string();
        let skip_arg = format!("--skip={offset}");
        let result = self
            .git(
                sandbox,
                workdir,
                &[
                    "log",
                    "--pretty=format:%H%x1f%an%x1f%ae%x1f%aI%x1f%s",
                    "-n",
                    &limit_arg,
                    &skip_arg,
                ],
            )
            .await;
        match result {
            Ok(raw) => Ok(parse_log_output(&raw)),
            // A freshly-created branch with no commits yet is an empty log,
            // not an error.
            Err(err) if err.message().contains("does not have any commits") => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Stage `files` (or everything) and commit; returns the new HEAD hash.
    pub async fn commit(
        &self,
        sandbox: &str,
        workdir: &str,
        message: &str,
        files: Option<&[String]>,
        author: &str,
    ) -> Result<String> {
        if message.trim().is_empty() {
            return Err(OrchestratorError::UserInput(
                "commit message must not be empty".into(),
            ));
        }

        match files {
            Some(files) if !files.is_empty() => {
                let normalized: Vec<String> =
                    files.iter().map(|f| normalize_commit_path(f)).collect();
                let mut args = vec!["add", "--"];
                args.extend(normalized.iter().map(String::as_str));
                self.git(sandbox, workdir, &args).await?;
            }
            _ => {
                self.git(sandbox, workdir, &["add", "-A"]).await?;
            }
        }

        let name_arg = format!("user.name={author}");
        let email_arg = format!("user.email={author}@devyard.local");
        let result = self
            .git(
                sandbox,
                workdir,
                &["-c", &name_arg, "-c", &email_arg, "commit", "-m", message],
            )
            .await;
        if let Err(err) = result {
            if err.message().contains("nothing to commit") {
                return Err(OrchestratorError::State("nothing to commit".into()));
            }
            return Err(err);
        }

        let head = self.git(sandbox, workdir, &["rev-parse", "HEAD"]).await?;
        Ok(head.trim().to_string())
    }

    pub async fn push(
        &self,
        sandbox: &str,
        workdir: &str,
        remote: &str,
        branch: Option<&str>,
    ) -> Result<String> {
        let argv = match branch {
            Some(branch) => vec!["git", "-C", workdir, "push", remote, branch],
            None => vec!["git", "-C", workdir, "push", "-u", remote, "HEAD"],
        };
        let output = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(argv).with_timeout(OrchestratorConfig::load().git_timeout),
            )
            .await?;
        if output.success() {
            // git reports push progress on stderr.
            Ok(output.stderr.trim().to_string())
        } else {
            Err(classify_git_exec(&output.stderr, &["push"]))
        }
    }
}

fn classify_git_exec(stderr: &str, args: &[&str]) -> OrchestratorError {
    let lowered = stderr.to_lowercase();
    let context = format!("git {}: {}", args.join(" "), stderr.trim());
    if lowered.contains("not a git repository") {
        OrchestratorError::State("no worktree".into())
    } else if lowered.contains("could not resolve host")
        || lowered.contains("unable to access")
        || lowered.contains("connection refused")
        || lowered.contains("could not read from remote")
    {
        OrchestratorError::Upstream(context)
    } else if lowered.contains("[rejected]") || lowered.contains("non-fast-forward") {
        OrchestratorError::conflict(context)
    } else if lowered.contains("no space left") {
        OrchestratorError::Resource(context)
    } else {
        OrchestratorError::Runtime(context)
    }
}

/// Parse `git status --porcelain=v2 --branch`.
pub fn parse_porcelain_status(raw: &str) -> GitStatus {
    let mut branch = String::new();
    let mut ahead = 0i64;
    let mut behind = 0i64;
    let mut files = Vec::new();

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("# branch.head ") {
            branch = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("# branch.ab ") {
            for part in rest.split_whitespace() {
                if let Some(n) = part.strip_prefix('+') {
                    ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = part.strip_prefix('-') {
                    behind = n.parse().unwrap_or(0);
                }
            }
        } else if let Some(rest) = line.strip_prefix("1 ") {
            if let Some(entry) = parse_changed_entry(rest, 6) {
                files.push(entry);
            }
        } else if let Some(rest) = line.strip_prefix("2 ") {
            // Renames carry "<path>\t<origPath>"; report the new path.
            if let Some(entry) = parse_changed_entry(rest, 7) {
                files.push(FileEntry {
                    path: entry.path.split('\t').next().unwrap_or("").to_string(),
                    ..entry
                });
            }
        } else if let Some(rest) = line.strip_prefix("u ") {
            if let Some(entry) = parse_changed_entry(rest, 8) {
                files.push(entry);
            }
        } else if let Some(path) = line.strip_prefix("? ") {
            files.push(FileEntry {
                path: path.to_string(),
                status: "??".to_string(),
                staged: false,
            });
        }
    }

    let clean = files.is_empty();
    GitStatus {
        branch,
        ahead,
        behind,
        files,
        clean,
    }
}

/// Split one changed/unmerged entry: `XY` first, path after `skip` more
/// space-separated metadata fields.
fn parse_changed_entry(rest: &str, skip: usize) -> Option<FileEntry> {
    let mut parts = rest.splitn(skip + 2, ' ');
    let xy = parts.next()?.to_string();
    let path = parts.nth(skip)?.to_string();
    let staged = xy.chars().next().map(|c| c != '.').unwrap_or(false);
    Some(FileEntry {
        path,
        status: xy,
        staged,
    })
}

pub fn parse_log_output(raw: &str) -> Vec<CommitInfo> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(5, '\u{1f}');
            Some(CommitInfo {
                hash: parts.next()?.to_string(),
                author: parts.next()?.to_string(),
                email: parts.next()?.to_string(),
                date: parts.next()?.to_string(),
                message: parts.next().unwrap_or("").to_string(),
            })
        })
        .filter(|commit| !commit.hash.is_empty())
        .collect()
}

/// Strip a leading porcelain status column (`M `, `?? `, `A  `) and rename
/// arrows from a caller-supplied commit path.
pub fn normalize_commit_path(raw: &str) -> String {
    fn is_status_char(c: char) -> bool {
        matches!(c, 'M' | 'A' | 'D' | 'R' | 'C' | 'U' | 'T' | '?' | '!' | '.')
    }

    let mut path = raw.trim();
    if let Some(space) = path.find(' ') {
        let (prefix, tail) = path.split_at(space);
        if !prefix.is_empty() && prefix.len() <= 2 && prefix.chars().all(is_status_char) {
            path = tail.trim_start();
        }
    }
    if let Some(arrow) = path.rfind(" -> ") {
        path = &path[arrow + 4..];
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_clean_tree() {
        let raw = "# branch.oid 8f5a1b2\n# branch.head main\n# branch.upstream origin/main\n# branch.ab +0 -0\n";
        let status = parse_porcelain_status(raw);
        assert_eq!(status.branch, "main");
        assert_eq!(status.ahead, 0);
        assert_eq!(status.behind, 0);
        assert!(status.clean);
        assert!(status.files.is_empty());
    }

    #[test]
    fn porcelain_changed_and_untracked() {
        let raw = concat!(
            "# branch.head feature/x\n",
            "# branch.ab +2 -1\n",
            "1 .M N... 100644 100644 100644 aaa bbb src/lib.rs\n",
            "1 A. N... 000000 100644 100644 000 ccc src/new.rs\n",
            "? notes.txt\n",
        );
        let status = parse_porcelain_status(raw);
        assert_eq!(status.branch, "feature/x");
        assert_eq!(status.ahead, 2);
        assert_eq!(status.behind, 1);
        assert!(!status.clean);
        assert_eq!(
            status.files,
            vec![
                FileEntry {
                    path: "src/lib.rs".to_string(),
                    status: ".M".to_string(),
                    staged: false,
                },
                FileEntry {
                    path: "src/new.rs".to_string(),
                    status: "A.".to_string(),
                    staged: true,
                },
                FileEntry {
                    path: "notes.txt".to_string(),
                    status: "??".to_string(),
                    staged: false,
                },
            ]
        );
    }

    #[test]
    fn porcelain_rename_reports_new_path() {
        let raw = "1 R. N... 100644 100644 100644 aaa bbb R100 new.rs\told.rs\n"
            .replace("1 R.", "2 R.");
        let status = parse_porcelain_status(&raw);
        assert_eq!(status.files.len(), 1);
        assert_eq!(status.files[0].path, "new.rs");
        assert!(status.files[0].staged);
    }

    #[test]
    fn log_parse_splits_on_unit_separator() {
        let raw = "abc123\u{1f}Alice\u{1f}alice@example.com\u{1f}2026-07-01T10:00:00+00:00\u{1f}fix: a thing\nxyz789\u{1f}Bob\u{1f}bob@example.com\u{1f}2026-06-30T09:00:00+00:00\u{1f}feat: another";
        let commits = parse_log_output(raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "abc123");
        assert_eq!(commits[0].author, "Alice");
        assert_eq!(commits[1].message, "feat: another");
    }

    #[test]
    fn commit_paths_are_normalized() {
        assert_eq!(normalize_commit_path("M src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_commit_path("?? notes.txt"), "notes.txt");
        assert_eq!(normalize_commit_path("A  src/new.rs"), "src/new.rs");
        assert_eq!(normalize_commit_path("src/plain.rs"), "src/plain.rs");
        assert_eq!(normalize_commit_path("R  old.rs -> new.rs"), "new.rs");
        // A real filename that merely starts with a capital is untouched.
        assert_eq!(normalize_commit_path("My File.txt"), "My File.txt");
    }

    #[test]
    fn push_rejection_is_conflict() {
        let err = classify_git_exec(
            "! [rejected]  main -> main (non-fast-forward)",
            &["push"],
        );
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn missing_worktree_is_state_error() {
        let err = classify_git_exec(
            "fatal: not a git repository (or any of the parent directories): .git",
            &["status"],
        );
        assert_eq!(err.kind(), "state");
        assert_eq!(err.message(), "no worktree");
    }
}
