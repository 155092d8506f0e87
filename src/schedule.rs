//! Resolution scheduling: a bounded worker pool over a batch of pin requests.
//!
//! Requests are deduplicated by key before dispatch, fanned out over a
//! multi-consumer work channel, and collected into a map. A failure for one key is carried in
//! its map entry and never stops the other workers.

use std::{
    collections::{BTreeSet, HashMap},
    num::NonZeroUsize,
    thread,
};

use crossbeam::channel;

use crate::model::PinKey;
use crate::resolve::{ResolveError, Resolved, Resolver};

/// The outcome for one distinct pin key.
pub type ResolutionResult = Result<Resolved, ResolveError>;

/// Runs resolutions on a fixed-size pool of scoped threads.
pub struct Scheduler<'a> {
    resolver: &'a Resolver,
    workers: NonZeroUsize,
}

impl<'a> Scheduler<'a> {
    pub fn new(resolver: &'a Resolver, workers: NonZeroUsize) -> Self {
        Self { resolver, workers }
    }

    /// Host parallelism, or one worker if it can't be determined.
    pub fn default_workers() -> NonZeroUsize {
        thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
    }

    /// Resolve every distinct key in `requests`.
    ///
    /// The returned map has exactly one entry per distinct key. Completion
    /// order across workers is unspecified; only the set of results is.
    pub fn run(&self, requests: &[PinKey]) -> HashMap<PinKey, ResolutionResult> {
        let distinct: BTreeSet<&PinKey> = requests.iter().collect();
        if distinct.is_empty() {
            return HashMap::new();
        }

        let workers = self.workers.get().min(distinct.len());
        tracing::debug!(
            requests = requests.len(),
            distinct = distinct.len(),
            workers,
            "resolving pin requests"
        );

        let (work_tx, work_rx) = channel::unbounded::<PinKey>();
        let (result_tx, result_rx) = channel::unbounded::<(PinKey, ResolutionResult)>();
        for key in distinct {
            // The receiver outlives this loop, so sending can't fail.
            let _ = work_tx.send(key.clone());
        }
        drop(work_tx);

        thread::scope(|s| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move || {
                    for key in work_rx {
                        let result = self.resolver.resolve(&key.identity, &key.reference);
                        if let Err(e) = &result {
                            tracing::debug!(key = %key, error = %e, "resolution failed");
                        }
                        if result_tx.send((key, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        result_rx.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        path::Path,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use crate::model::ActionIdentity;
    use crate::resolve::{CloneDepth, CommandError, MirrorCache, MirrorOps, RefKind, RemoteRefs};

    /// Remote that knows `v<n>` tags for every action and counts lookups per ref.
    #[derive(Default, Clone)]
    struct VersionedRemote {
        lookups: Arc<Mutex<HashMap<String, usize>>>,
    }

    impl RemoteRefs for VersionedRemote {
        fn lookup_ref(&self, identity: &ActionIdentity, name: &str, kind: RefKind) -> Option<String> {
            if kind != RefKind::Tag {
                return None;
            }
            *self
                .lookups
                .lock()
                .entry(format!("{identity}@{name}"))
                .or_default() += 1;
            let digit = name.strip_prefix('v')?.parse::<u8>().ok()?;
            let c = char::from_digit(u32::from(digit % 10), 10)?;
            Some(std::iter::repeat_n(c, 40).collect())
        }
    }

    /// Mirror where nothing resolves; clones just create the directory.
    #[derive(Default, Clone)]
    struct EmptyMirror {
        clones: Arc<AtomicUsize>,
    }

    impl MirrorOps for EmptyMirror {
        fn clone_shallow(
            &self,
            _identity: &ActionIdentity,
            dest: &Path,
            _depth: CloneDepth,
        ) -> Result<(), CommandError> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(dest.join(".git")).unwrap();
            Ok(())
        }

        fn refresh_tags(&self, _dir: &Path) -> Result<(), CommandError> {
            Ok(())
        }

        fn revision_of(&self, _dir: &Path, rev: &str) -> Result<String, CommandError> {
            Err(CommandError::Failed {
                command: format!("git rev-list -n 1 {rev}"),
                stderr: "unknown revision".into(),
            })
        }

        fn fetch_tag(&self, _dir: &Path, _tag: &str) -> Result<(), CommandError> {
            Err(CommandError::Failed {
                command: "git fetch".into(),
                stderr: "no such ref".into(),
            })
        }

        fn fetch_branch(&self, _dir: &Path, _branch: &str) -> Result<(), CommandError> {
            Err(CommandError::Failed {
                command: "git fetch".into(),
                stderr: "no such ref".into(),
            })
        }

        fn list_tags_with_prefix(
            &self,
            _dir: &Path,
            _prefix: &str,
        ) -> Result<Vec<String>, CommandError> {
            Ok(Vec::new())
        }
    }

    fn key(action: &str, reference: &str) -> PinKey {
        PinKey::new(ActionIdentity::parse(action).unwrap(), reference)
    }

    fn setup() -> (TempDir, VersionedRemote, EmptyMirror, Resolver) {
        let dir = TempDir::new().unwrap();
        let remote = VersionedRemote::default();
        let mirror = EmptyMirror::default();
        let resolver = Resolver::new(
            remote.clone(),
            mirror.clone(),
            MirrorCache::new(dir.path().join("actions")),
        );
        (dir, remote, mirror, resolver)
    }

    #[test]
    fn empty_batch_yields_empty_map() {
        let (_dir, _remote, _mirror, resolver) = setup();
        let scheduler = Scheduler::new(&resolver, NonZeroUsize::MIN);
        assert!(scheduler.run(&[]).is_empty());
    }

    #[test]
    fn duplicates_resolve_once_into_one_entry() {
        let (_dir, remote, _mirror, resolver) = setup();
        let scheduler = Scheduler::new(&resolver, NonZeroUsize::new(4).unwrap());
        let requests = [
            key("actions/checkout", "v3"),
            key("actions/checkout", "v3"),
            key("actions/checkout", "v4"),
        ];

        let results = scheduler.run(&requests);

        assert_eq!(results.len(), 2);
        let v3 = results[&key("actions/checkout", "v3")].as_ref().unwrap();
        assert_eq!(v3.hash, "3".repeat(40));
        assert_eq!(remote.lookups.lock()["actions/checkout@v3"], 1);
        assert_eq!(remote.lookups.lock()["actions/checkout@v4"], 1);
    }

    #[test]
    fn same_action_at_two_refs_is_two_keys() {
        let (_dir, _remote, _mirror, resolver) = setup();
        let scheduler = Scheduler::new(&resolver, NonZeroUsize::MIN);

        let results = scheduler.run(&[key("a/b", "v1"), key("a/b", "v2")]);

        assert_eq!(results[&key("a/b", "v1")].as_ref().unwrap().hash, "1".repeat(40));
        assert_eq!(results[&key("a/b", "v2")].as_ref().unwrap().hash, "2".repeat(40));
    }

    #[test]
    fn failures_are_carried_per_key() {
        let (_dir, _remote, mirror, resolver) = setup();
        let scheduler = Scheduler::new(&resolver, NonZeroUsize::new(3).unwrap());
        let requests = [
            key("a/b", "v1"),
            key("a/b", "main"),
            key("a/b", "v1.2.3"),
            key("c/d", "v2"),
        ];

        let results = scheduler.run(&requests);

        assert_eq!(results.len(), 4);
        assert!(results[&key("a/b", "v1")].is_ok());
        assert!(results[&key("c/d", "v2")].is_ok());
        assert!(matches!(
            results[&key("a/b", "main")],
            Err(ResolveError::NotFound { .. })
        ));
        assert!(results[&key("a/b", "v1.2.3")].as_ref().unwrap_err().is_unresolved());
        // Two failing refs of one action share its single mirror.
        assert_eq!(mirror.clones.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let requests: Vec<PinKey> = (0..8)
            .map(|i| key(&format!("org/action-{}", i % 3), &format!("v{i}")))
            .collect();

        let (_d1, _r1, _m1, single) = setup();
        let (_d2, _r2, _m2, many) = setup();
        let one = Scheduler::new(&single, NonZeroUsize::MIN).run(&requests);
        let eight = Scheduler::new(&many, NonZeroUsize::new(8).unwrap()).run(&requests);

        assert_eq!(one.len(), 8);
        for (key, result) in &one {
            assert_eq!(result.as_ref().unwrap(), eight[key].as_ref().unwrap());
        }
    }
}
