//! Per-document (and per-repository) counts of what happened to each invocation.

use std::ops::AddAssign;

/// Summary counts for a processing run.
///
/// Always produced, even when individual resolutions fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Every non-empty `uses` value seen.
    pub found: usize,

    /// Invocations rewritten to a commit hash.
    pub pinned: usize,

    pub already_pinned: usize,

    /// Local or excluded invocations, plus refs that could not be resolved.
    pub skipped: usize,

    /// Invocations using the mutable `latest` alias.
    pub with_latest: usize,

    /// Invocations with no `@ref` at all.
    pub without_ref: usize,

    /// Semantic-version refs annotated for a manual pin.
    pub unresolved: usize,

    pub malformed: usize,
}

impl AddAssign for Tally {
    fn add_assign(&mut self, other: Self) {
        self.found += other.found;
        self.pinned += other.pinned;
        self.already_pinned += other.already_pinned;
        self.skipped += other.skipped;
        self.with_latest += other.with_latest;
        self.without_ref += other.without_ref;
        self.unresolved += other.unresolved;
        self.malformed += other.malformed;
    }
}
