//! On-disk mirror cache of action repositories.
//!
//! Each action identity gets at most one mirror clone:
//!
//! ```text
//! <root>/<owner>/<name>/    # clone of github.com/<owner>/<name>
//! ```
//!
//! Mirrors are created lazily and never deleted by resolution; `clean`
//! removes the whole root and is meant for the command line.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::model::ActionIdentity;

use super::{CloneDepth, CommandError, MirrorOps};

/// Clone depths tried in order when creating a mirror.
pub const CLONE_DEPTHS: [CloneDepth; 3] = [
    CloneDepth::Shallow(1),
    CloneDepth::Shallow(10),
    CloneDepth::Full,
];

/// Errors preparing a mirror directory.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to clone action repository: {0}")]
    Clone(#[source] CommandError),
}

/// Mirror clones keyed by action identity, with one lock per identity.
#[derive(Debug)]
pub struct MirrorCache {
    root: PathBuf,
    locks: Mutex<HashMap<ActionIdentity, Arc<Mutex<()>>>>,
}

impl MirrorCache {
    /// Creates a cache rooted at the given directory.
    ///
    /// Nothing is written until the first mirror is needed.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the default cache root.
    ///
    /// `<user cache dir>/pinner/actions`, or `<temp>/pinner-cache/actions`
    /// when the platform has no cache directory.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir().map_or_else(
            || std::env::temp_dir().join("pinner-cache").join("actions"),
            |d| d.join("pinner").join("actions"),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The mirror directory for an identity, whether or not it exists yet.
    pub fn mirror_dir(&self, identity: &ActionIdentity) -> PathBuf {
        self.root.join(identity.owner()).join(identity.name())
    }

    /// Ensure a mirror exists for `identity`, then run `f` against it.
    ///
    /// The whole call holds the identity's lock, so concurrent workers
    /// resolving different refs of one action never clone or fetch into the
    /// same directory at the same time. Different identities don't contend.
    pub fn with_mirror<T>(
        &self,
        identity: &ActionIdentity,
        ops: &dyn MirrorOps,
        f: impl FnOnce(&Path) -> T,
    ) -> Result<T, CacheError> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock();

        let dir = self.ensure(identity, ops)?;
        Ok(f(&dir))
    }

    /// Remove the whole cache root. Returns whether anything was removed.
    pub fn clean(&self) -> io::Result<bool> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn lock_for(&self, identity: &ActionIdentity) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(identity.clone()).or_default())
    }

    /// Clone on a miss (escalating depth), refresh tags on a hit.
    ///
    /// A directory without `.git` is what an interrupted clone leaves
    /// behind; it is removed and cloned again.
    fn ensure(&self, identity: &ActionIdentity, ops: &dyn MirrorOps) -> Result<PathBuf, CacheError> {
        let dir = self.mirror_dir(identity);

        if dir.join(".git").exists() {
            tracing::debug!(action = %identity, dir = %dir.display(), "using cached mirror");
            if let Err(e) = ops.refresh_tags(&dir) {
                tracing::warn!(action = %identity, error = %e, "failed to refresh cached mirror");
            }
            return Ok(dir);
        }

        if dir.exists() {
            tracing::warn!(action = %identity, dir = %dir.display(), "discarding incomplete mirror");
            remove_partial(identity, &dir);
        }

        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut last_error = None;
        for depth in CLONE_DEPTHS {
            tracing::debug!(action = %identity, ?depth, "cloning action repository");
            match ops.clone_shallow(identity, &dir, depth) {
                Ok(()) => return Ok(dir),
                Err(e) => {
                    tracing::debug!(action = %identity, ?depth, error = %e, "clone failed");
                    // A failed clone may leave a partial directory behind.
                    remove_partial(identity, &dir);
                    last_error = Some(e);
                }
            }
        }

        Err(CacheError::Clone(last_error.unwrap_or_else(|| {
            CommandError::Failed {
                command: format!("clone {identity}"),
                stderr: "no clone attempted".to_string(),
            }
        })))
    }
}

fn remove_partial(identity: &ActionIdentity, dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(action = %identity, dir = %dir.display(), error = %e, "failed to remove partial mirror");
        }
    }
}
