//! GitHub-backed resolution: `gh` for remote lookups and clones, `git` for mirrors.
//!
//! When a `GH_CONFIG_DIR` is configured it is passed to every `gh` call,
//! so lookups authenticate as that account.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;

use crate::model::ActionIdentity;
use crate::resolve::{CloneDepth, CommandError, MirrorOps, RefKind, RemoteRefs};

/// Remote ref lookups through `gh api`.
#[derive(Debug, Clone, Default)]
pub struct GhRemote {
    gh_config: Option<PathBuf>,
}

impl GhRemote {
    pub fn new(gh_config: Option<PathBuf>) -> Self {
        Self { gh_config }
    }
}

/// JSON shape returned by `gh api repos/<owner>/<name>/git/refs/...`.
#[derive(Deserialize)]
struct GhRef {
    object: GhRefObject,
}

#[derive(Deserialize)]
struct GhRefObject {
    sha: String,
    #[serde(rename = "type", default)]
    kind: String,
}

/// JSON shape returned by `gh api repos/<owner>/<name>/git/tags/<sha>`.
#[derive(Deserialize)]
struct GhTag {
    object: GhRefObject,
}

/// Annotated tags can point at other tags; follow at most this many.
const MAX_TAG_PEELS: usize = 4;

impl RemoteRefs for GhRemote {
    fn lookup_ref(&self, identity: &ActionIdentity, name: &str, kind: RefKind) -> Option<String> {
        let endpoint = ref_endpoint(identity, name, kind);
        let json = match run_gh(&["api", endpoint.as_str()], self.gh_config.as_deref()) {
            Ok(json) => json,
            Err(e) => {
                tracing::debug!(action = %identity, name, ?kind, error = %e, "remote ref lookup failed");
                return None;
            }
        };
        let object = parse_ref_object(&json)?;
        self.peel(identity, object)
    }
}

impl GhRemote {
    /// Follow annotated tag objects down to the commit they tag.
    fn peel(&self, identity: &ActionIdentity, mut object: GhRefObject) -> Option<String> {
        for _ in 0..MAX_TAG_PEELS {
            if object.kind != "tag" {
                return Some(object.sha);
            }
            let endpoint = format!(
                "repos/{}/{}/git/tags/{}",
                identity.owner(),
                identity.name(),
                object.sha
            );
            let json = run_gh(&["api", endpoint.as_str()], self.gh_config.as_deref())
                .inspect_err(|e| {
                    tracing::debug!(action = %identity, error = %e, "annotated tag lookup failed");
                })
                .ok()?;
            object = serde_json::from_str::<GhTag>(&json).ok()?.object;
        }
        tracing::debug!(action = %identity, "annotated tag chain too deep");
        None
    }
}

/// Mirror clones driven by `gh repo clone` and `git`.
#[derive(Debug, Clone, Default)]
pub struct GitMirror {
    gh_config: Option<PathBuf>,
}

impl GitMirror {
    pub fn new(gh_config: Option<PathBuf>) -> Self {
        Self { gh_config }
    }
}

impl MirrorOps for GitMirror {
    fn clone_shallow(
        &self,
        identity: &ActionIdentity,
        dest: &Path,
        depth: CloneDepth,
    ) -> Result<(), CommandError> {
        let repo = identity.to_string();
        let dest = dest.to_string_lossy();
        let depth_arg = match depth {
            CloneDepth::Shallow(n) => Some(format!("--depth={n}")),
            CloneDepth::Full => None,
        };

        let mut args = vec!["repo", "clone", repo.as_str(), dest.as_ref()];
        if let Some(depth_arg) = &depth_arg {
            args.extend(["--", depth_arg.as_str()]);
        }

        run_gh(&args, self.gh_config.as_deref()).map(drop)
    }

    fn refresh_tags(&self, dir: &Path) -> Result<(), CommandError> {
        run_git(dir, &["fetch", "origin", "--tags", "--quiet"]).map(drop)
    }

    fn revision_of(&self, dir: &Path, rev: &str) -> Result<String, CommandError> {
        let out = run_git(dir, &["rev-list", "-n", "1", rev])?;
        let hash = out.trim();
        if hash.is_empty() {
            return Err(CommandError::Failed {
                command: format!("git rev-list -n 1 {rev}"),
                stderr: "no commit".to_string(),
            });
        }
        Ok(hash.to_string())
    }

    fn fetch_tag(&self, dir: &Path, tag: &str) -> Result<(), CommandError> {
        let refspec = fetch_refspec(RefKind::Tag, tag);
        run_git(dir, &["fetch", "origin", refspec.as_str(), "--quiet"]).map(drop)
    }

    fn fetch_branch(&self, dir: &Path, branch: &str) -> Result<(), CommandError> {
        let refspec = fetch_refspec(RefKind::Branch, branch);
        run_git(dir, &["fetch", "origin", refspec.as_str(), "--quiet"]).map(drop)
    }

    fn list_tags_with_prefix(
        &self,
        dir: &Path,
        prefix: &str,
    ) -> Result<Vec<String>, CommandError> {
        let pattern = format!("{prefix}*");
        let out = run_git(dir, &["tag", "-l", pattern.as_str()])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

// ── Helpers ──

/// `repos/<owner>/<name>/git/refs/<tags|heads>/<name>`.
fn ref_endpoint(identity: &ActionIdentity, name: &str, kind: RefKind) -> String {
    format!(
        "repos/{}/{}/git/refs/{}/{name}",
        identity.owner(),
        identity.name(),
        kind.namespace()
    )
}

/// Tags land on the local tag; branches on the remote-tracking ref.
fn fetch_refspec(kind: RefKind, name: &str) -> String {
    match kind {
        RefKind::Tag => format!("+refs/tags/{name}:refs/tags/{name}"),
        RefKind::Branch => format!("+refs/heads/{name}:refs/remotes/origin/{name}"),
    }
}

/// Extract `object` from a ref response.
///
/// A prefix query can return an array of refs instead of one object;
/// that is not an exact match and yields `None`.
fn parse_ref_object(json: &str) -> Option<GhRefObject> {
    let gh_ref: GhRef = serde_json::from_str(json).ok()?;
    Some(gh_ref.object)
}

/// Run a git command in `dir` and return its stdout on success.
fn run_git(dir: &Path, args: &[&str]) -> Result<String, CommandError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|source| CommandError::Spawn {
            program: "git".to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandError::Failed {
            command: format!("git {}", args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a gh command with an optional config directory and return stdout on success.
fn run_gh(args: &[&str], gh_config: Option<&Path>) -> Result<String, CommandError> {
    let mut command = Command::new("gh");
    command.args(args);
    if let Some(config) = gh_config {
        command.env("GH_CONFIG_DIR", config);
    }

    let output = command.output().map_err(|source| CommandError::Spawn {
        program: "gh".to_string(),
        source,
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandError::Failed {
            command: format!("gh {}", args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ActionIdentity {
        ActionIdentity::parse("actions/checkout").unwrap()
    }

    #[test]
    fn tag_and_branch_endpoints() {
        assert_eq!(
            ref_endpoint(&identity(), "v4", RefKind::Tag),
            "repos/actions/checkout/git/refs/tags/v4"
        );
        assert_eq!(
            ref_endpoint(&identity(), "main", RefKind::Branch),
            "repos/actions/checkout/git/refs/heads/main"
        );
    }

    #[test]
    fn refspecs_target_local_tag_and_tracking_branch() {
        assert_eq!(
            fetch_refspec(RefKind::Tag, "v1.2"),
            "+refs/tags/v1.2:refs/tags/v1.2"
        );
        assert_eq!(
            fetch_refspec(RefKind::Branch, "release"),
            "+refs/heads/release:refs/remotes/origin/release"
        );
    }

    #[test]
    fn parse_ref_object_from_single_ref() {
        let json = r#"{
            "ref": "refs/tags/v4",
            "node_id": "MDM6UmVm",
            "object": {"sha": "11bd71901bbe5b1630ceea73d27597364c9af683", "type": "commit"}
        }"#;
        let object = parse_ref_object(json).unwrap();
        assert_eq!(object.sha, "11bd71901bbe5b1630ceea73d27597364c9af683");
        assert_eq!(object.kind, "commit");
    }

    #[test]
    fn parse_ref_object_rejects_prefix_listing() {
        let json = r#"[{"ref": "refs/tags/v4.1", "object": {"sha": "abc"}}]"#;
        assert!(parse_ref_object(json).is_none());
    }

    #[test]
    fn parse_ref_object_rejects_garbage() {
        assert!(parse_ref_object("not json").is_none());
    }

    #[test]
    fn run_git_reports_failure_with_command() {
        let dir = tempfile::TempDir::new().unwrap();
        // Either git is missing (spawn error) or the directory isn't a repository.
        let err = run_git(dir.path(), &["rev-list", "-n", "1", "v1"]).unwrap_err();
        match err {
            CommandError::Failed { command, .. } => assert_eq!(command, "git rev-list -n 1 v1"),
            CommandError::Spawn { program, .. } => assert_eq!(program, "git"),
        }
    }
}
