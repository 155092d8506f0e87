//! Patch application: rewrite resolved invocations in place.
//!
//! The document is never re-serialized. Each [`PatchOp`] is an exact-match
//! substitution of a `uses:` line, applied only where that text is a step's
//! `uses` key and its complete value, so comments and formatting elsewhere
//! survive byte for byte.

use std::collections::{HashMap, HashSet};

use jiff::civil::Date;

use crate::classify::Invocation;
use crate::model::{ActionReference, PinKey};
use crate::resolve::Resolved;
use crate::schedule::ResolutionResult;

/// Appended to semantic-version refs that need a human to choose a pin.
pub const MANUAL_PIN_MARKER: &str = "TODO: pin to a commit hash";

/// Plain, double-quoted, and single-quoted scalars.
const QUOTES: [&str; 3] = ["", "\"", "'"];

/// Which occurrences of an identical invocation string get patched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OccurrencePolicy {
    /// Only the first remaining occurrence.
    #[default]
    First,

    /// Every occurrence, identically.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Replace the ref with a commit hash.
    Pin,

    /// Keep the ref, flag it for a manual pin.
    Annotate,
}

/// One substitution: `uses: <invocation>` becomes `uses: <value> # <comment>`.
///
/// A quoted invocation keeps its quotes around the new value; the comment
/// always goes after the closing quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOp {
    pub invocation: String,
    pub value: String,
    pub comment: String,
    pub kind: PatchKind,
}

impl PatchOp {
    /// `<action>@<hash> # <resolved ref> on <date>`.
    pub fn pin(uses: &str, reference: &ActionReference, resolved: &Resolved, date: Date) -> Self {
        Self {
            invocation: uses.to_string(),
            value: format!("{}@{}", reference.action, resolved.hash),
            comment: format!("{} on {date}", resolved.reference),
            kind: PatchKind::Pin,
        }
    }

    /// `<uses> # <ref> on <date>, TODO: pin to a commit hash`.
    pub fn annotate(uses: &str, reference: &ActionReference, date: Date) -> Self {
        Self {
            invocation: uses.to_string(),
            value: uses.to_string(),
            comment: format!("{} on {date}, {MANUAL_PIN_MARKER}", reference.reference),
            kind: PatchKind::Annotate,
        }
    }

    fn needle(&self, quote: &str) -> String {
        format!("uses: {quote}{}{quote}", self.invocation)
    }

    /// The replacement value and comment, with `quote` around the value.
    fn rendered(&self, quote: &str) -> String {
        format!("{quote}{}{quote} # {}", self.value, self.comment)
    }
}

/// Build one op per distinct invocation string that resolved or needs a manual pin.
///
/// Invocations whose key failed any other way produce no op.
pub fn plan(
    invocations: &[Invocation],
    results: &HashMap<PinKey, ResolutionResult>,
    date: Date,
) -> Vec<PatchOp> {
    let mut seen = HashSet::new();
    let mut ops = Vec::new();

    for invocation in invocations {
        let Some(reference) = invocation.reference() else {
            continue;
        };
        if !seen.insert(invocation.uses.as_str()) {
            continue;
        }
        match results.get(&reference.key()) {
            Some(Ok(resolved)) => {
                ops.push(PatchOp::pin(&invocation.uses, reference, resolved, date));
            }
            Some(Err(e)) if e.is_unresolved() => {
                ops.push(PatchOp::annotate(&invocation.uses, reference, date));
            }
            _ => {}
        }
    }
    ops
}

/// The patched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub text: String,
    pub changed: bool,

    /// Substitutions that pinned a hash.
    pub pinned: usize,

    /// Substitutions that added a manual-pin annotation.
    pub annotated: usize,

    /// Pin invocations with no rewritable `uses:` line in the text.
    pub unmatched: Vec<String>,
}

/// Apply `ops` to `original`.
pub fn apply(original: &str, ops: &[PatchOp], policy: OccurrencePolicy) -> Patched {
    let mut text = original.to_string();
    let mut pinned = 0;
    let mut annotated = 0;
    let mut unmatched = Vec::new();

    for op in ops {
        let mut applied = 0;
        let mut from = 0;

        while let Some((start, quote)) = next_occurrence(&text, op, from) {
            let rendered = op.rendered(quote);
            let value_start = start + "uses: ".len();
            let value_end = start + op.needle(quote).len();
            text.replace_range(value_start..value_end, &rendered);
            from = value_start + rendered.len();
            applied += 1;
            if policy == OccurrencePolicy::First {
                break;
            }
        }

        match op.kind {
            PatchKind::Pin => pinned += applied,
            PatchKind::Annotate => annotated += applied,
        }
        if applied == 0 && op.kind == PatchKind::Pin {
            tracing::debug!(uses = %op.invocation, "no rewritable uses line");
            unmatched.push(op.invocation.clone());
        }
    }

    Patched {
        changed: text != original,
        text,
        pinned,
        annotated,
        unmatched,
    }
}

/// The earliest occurrence of `op` at or after `from`, in any quoting style.
fn next_occurrence(text: &str, op: &PatchOp, from: usize) -> Option<(usize, &'static str)> {
    QUOTES
        .iter()
        .filter_map(|&quote| {
            find_occurrence(text, &op.needle(quote), from, op.kind).map(|start| (start, quote))
        })
        .min_by_key(|&(start, _)| start)
}

/// Byte offset of the next complete `uses` value matching `needle`, at or after `from`.
///
/// The match must be a step key: only indentation and an optional `- `
/// may precede it on its line, which rules out comments and block scalars.
/// It must also end the value (end of text or whitespace after it), so
/// `a/b@v1` never matches inside `a/b@v1.2`. Lines already flagged for a
/// manual pin aren't annotated twice.
fn find_occurrence(text: &str, needle: &str, from: usize, kind: PatchKind) -> Option<usize> {
    let haystack = text.get(from..)?;
    haystack
        .match_indices(needle)
        .map(|(offset, _)| from + offset)
        .find(|&start| {
            let end = start + needle.len();
            let line_start = text[..start].rfind('\n').map_or(0, |i| i + 1);
            let key_ok = is_step_key_prefix(&text[line_start..start]);
            let after_ok = text[end..].chars().next().is_none_or(char::is_whitespace);
            let already_flagged =
                kind == PatchKind::Annotate && line_at(text, start).contains(MANUAL_PIN_MARKER);
            key_ok && after_ok && !already_flagged
        })
}

/// Whether `prefix` is indentation, optionally followed by a sequence dash.
fn is_step_key_prefix(prefix: &str) -> bool {
    let rest = prefix.trim_start();
    if rest.is_empty() {
        return true;
    }
    rest.strip_prefix('-')
        .is_some_and(|after| !after.is_empty() && after.trim_start().is_empty())
}

/// The full line containing byte offset `at`, without its newline.
fn line_at(text: &str, at: usize) -> &str {
    let start = text[..at].rfind('\n').map_or(0, |i| i + 1);
    let end = text[at..].find('\n').map_or(text.len(), |i| at + i);
    &text[start..end]
}
