//! Version resolution: turn an action ref into a commit hash.
//!
//! Tiers are tried in order, stopping at the first hit:
//!
//! 1. Remote tag lookup.
//! 2. Remote branch lookup.
//! 3. The action's mirror clone: direct lookup, then an explicit tag fetch,
//!    then an explicit branch fetch.
//! 4. Prefix fallback: the lexicographically greatest local tag starting with
//!    the ref, resolved once more as a concrete tag name.
//!
//! A strict semantic version (`v1.2.3`) that survives tier 3 is reported as
//! [`ResolveError::Unresolved`] rather than guessed at.

mod cache;

use std::{path::Path, sync::OnceLock, time::Instant};

use regex::Regex;

use crate::classify::is_commit_hash;
use crate::model::ActionIdentity;

pub use cache::{CLONE_DEPTHS, CacheError, MirrorCache};

/// How many times the prefix fallback may hand a new tag name back to the chain.
pub const MAX_PREFIX_HOPS: usize = 1;

static SEMVER_RE: OnceLock<Regex> = OnceLock::new();

fn semver_re() -> &'static Regex {
    SEMVER_RE.get_or_init(|| Regex::new(r"^v?\d+\.\d+\.\d+$").unwrap())
}

/// Whether `reference` is a strict `v?MAJOR.MINOR.PATCH` version.
pub fn is_strict_semver(reference: &str) -> bool {
    semver_re().is_match(reference)
}

/// A remote ref namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Tag,
    Branch,
}

impl RefKind {
    /// The path segment under `refs/`.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Tag => "tags",
            Self::Branch => "heads",
        }
    }
}

/// How much history to clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneDepth {
    Shallow(u32),
    Full,
}

/// A failed subprocess.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Remote ref lookup against the hosting forge.
pub trait RemoteRefs: Send + Sync {
    /// The commit hash `refs/<kind>/<name>` points at, or `None` if it doesn't
    /// exist or the lookup failed.
    fn lookup_ref(&self, identity: &ActionIdentity, name: &str, kind: RefKind) -> Option<String>;
}

/// Version-control operations against a local mirror clone.
pub trait MirrorOps: Send + Sync {
    fn clone_shallow(
        &self,
        identity: &ActionIdentity,
        dest: &Path,
        depth: CloneDepth,
    ) -> Result<(), CommandError>;

    /// Fetch all tags from the remote into an existing mirror.
    fn refresh_tags(&self, dir: &Path) -> Result<(), CommandError>;

    /// The commit hash a revision resolves to.
    fn revision_of(&self, dir: &Path, rev: &str) -> Result<String, CommandError>;

    /// Fetch `refs/tags/<tag>` into the local tag of the same name.
    fn fetch_tag(&self, dir: &Path, tag: &str) -> Result<(), CommandError>;

    /// Fetch `refs/heads/<branch>` into `refs/remotes/origin/<branch>`.
    fn fetch_branch(&self, dir: &Path, branch: &str) -> Result<(), CommandError>;

    /// Local tag names starting with `prefix`.
    fn list_tags_with_prefix(&self, dir: &Path, prefix: &str)
    -> Result<Vec<String>, CommandError>;
}

/// A successfully resolved ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub hash: String,

    /// The ref that produced the hash: the requested one, or the tag the
    /// prefix fallback settled on.
    pub reference: String,
}

/// Why a ref could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A semantic version with no matching tag: needs a human to pick a pin.
    #[error("unresolved version {identity}@{reference}")]
    Unresolved {
        identity: ActionIdentity,
        reference: String,
    },

    #[error("version not found: {identity}@{reference}{}", fallback_note(.fallback.as_deref()))]
    NotFound {
        identity: ActionIdentity,
        reference: String,

        /// The prefix-matched tag that was tried in place of `reference`.
        fallback: Option<String>,
    },

    #[error("mirror unavailable for {identity}: {source}")]
    Infrastructure {
        identity: ActionIdentity,
        #[source]
        source: CacheError,
    },
}

fn fallback_note(fallback: Option<&str>) -> String {
    fallback.map_or_else(String::new, |tag| format!(" (also tried tag {tag})"))
}

impl ResolveError {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved { .. })
    }
}

/// What the mirror tier found.
enum MirrorOutcome {
    Hash(String),
    /// Nothing direct, but this local tag extends the ref.
    PrefixTag(String),
}

/// Resolves action refs through the remote and a shared mirror cache.
///
/// Safe to share between threads; per-identity mirror work is serialized by
/// the cache.
pub struct Resolver {
    remote: Box<dyn RemoteRefs>,
    mirror: Box<dyn MirrorOps>,
    cache: MirrorCache,
}

impl Resolver {
    pub fn new(
        remote: impl RemoteRefs + 'static,
        mirror: impl MirrorOps + 'static,
        cache: MirrorCache,
    ) -> Self {
        Self {
            remote: Box::new(remote),
            mirror: Box::new(mirror),
            cache,
        }
    }

    /// Resolve `reference` of `identity` to a commit hash.
    pub fn resolve(
        &self,
        identity: &ActionIdentity,
        reference: &str,
    ) -> Result<Resolved, ResolveError> {
        let start = Instant::now();
        let result = self.resolve_chain(identity, reference);
        tracing::debug!(
            action = %identity,
            reference,
            elapsed = ?start.elapsed(),
            ok = result.is_ok(),
            "resolution finished"
        );
        result
    }

    fn resolve_chain(
        &self,
        identity: &ActionIdentity,
        reference: &str,
    ) -> Result<Resolved, ResolveError> {
        let mut current = reference.to_string();

        for hop in 0..=MAX_PREFIX_HOPS {
            if let Some(hash) = self.resolve_remote(identity, &current) {
                return Ok(Resolved {
                    hash,
                    reference: current,
                });
            }

            let allow_prefix = hop < MAX_PREFIX_HOPS;
            match self.resolve_in_mirror(identity, &current, allow_prefix) {
                Ok(MirrorOutcome::Hash(hash)) => {
                    return Ok(Resolved {
                        hash,
                        reference: current,
                    });
                }
                Ok(MirrorOutcome::PrefixTag(tag)) => {
                    tracing::debug!(action = %identity, from = %current, to = %tag, "falling back to prefix-matched tag");
                    current = tag;
                }
                Err(ResolveError::NotFound { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        // Always report the ref as written in the workflow.
        Err(ResolveError::NotFound {
            identity: identity.clone(),
            reference: reference.to_string(),
            fallback: (current != reference).then_some(current),
        })
    }

    fn resolve_remote(&self, identity: &ActionIdentity, reference: &str) -> Option<String> {
        for kind in [RefKind::Tag, RefKind::Branch] {
            if let Some(hash) = self.remote.lookup_ref(identity, reference, kind) {
                tracing::debug!(action = %identity, reference, ?kind, "resolved via remote lookup");
                return Some(hash);
            }
        }
        None
    }

    fn resolve_in_mirror(
        &self,
        identity: &ActionIdentity,
        reference: &str,
        allow_prefix: bool,
    ) -> Result<MirrorOutcome, ResolveError> {
        self.cache
            .with_mirror(identity, self.mirror.as_ref(), |dir| {
                self.lookup_in_mirror(identity, dir, reference, allow_prefix)
            })
            .map_err(|source| ResolveError::Infrastructure {
                identity: identity.clone(),
                source,
            })?
    }

    /// Runs with the identity's mirror lock held.
    fn lookup_in_mirror(
        &self,
        identity: &ActionIdentity,
        dir: &Path,
        reference: &str,
        allow_prefix: bool,
    ) -> Result<MirrorOutcome, ResolveError> {
        let ops = self.mirror.as_ref();

        if let Ok(hash) = ops.revision_of(dir, reference) {
            return Ok(MirrorOutcome::Hash(hash));
        }

        if !is_commit_hash(reference) {
            if ops.fetch_tag(dir, reference).is_ok()
                && let Ok(hash) = ops.revision_of(dir, reference)
            {
                return Ok(MirrorOutcome::Hash(hash));
            }
            if ops.fetch_branch(dir, reference).is_ok()
                && let Ok(hash) = ops.revision_of(dir, &format!("origin/{reference}"))
            {
                return Ok(MirrorOutcome::Hash(hash));
            }
        }

        if is_strict_semver(reference) {
            return Err(ResolveError::Unresolved {
                identity: identity.clone(),
                reference: reference.to_string(),
            });
        }

        if allow_prefix {
            let tags = match ops.list_tags_with_prefix(dir, reference) {
                Ok(tags) => tags,
                Err(e) => {
                    tracing::debug!(action = %identity, reference, error = %e, "tag listing failed");
                    Vec::new()
                }
            };
            if let Some(tag) = pick_prefix_tag(tags, reference) {
                return Ok(MirrorOutcome::PrefixTag(tag));
            }
        }

        Err(ResolveError::NotFound {
            identity: identity.clone(),
            reference: reference.to_string(),
            fallback: None,
        })
    }
}

/// The lexicographically greatest tag extending `reference`.
///
/// String order, not version order: `v2.1.0-beta` beats `v2.1.0`.
pub fn pick_prefix_tag(tags: impl IntoIterator<Item = String>, reference: &str) -> Option<String> {
    tags.into_iter()
        .filter(|tag| tag.starts_with(reference) && tag != reference)
        .max()
}
