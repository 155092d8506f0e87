//! Output formatting for CLI display.

use crate::model::{ActionIdentity, Tally};
use crate::resolve::Resolved;
use crate::workflow::{Notice, NoticeKind};

/// Format a tally as an aligned summary block.
pub(super) fn format_tally(tally: &Tally) -> String {
    let rows = [
        ("found", tally.found),
        ("pinned", tally.pinned),
        ("already pinned", tally.already_pinned),
        ("skipped", tally.skipped),
        ("using latest", tally.with_latest),
        ("without tag/ref", tally.without_ref),
        ("manual pin", tally.unresolved),
        ("malformed", tally.malformed),
    ];
    rows.iter()
        .map(|(label, count)| format!("  {label:<16}{count}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format a notice with its location in the workflow.
pub(super) fn format_notice(notice: &Notice) -> String {
    let location = format!("jobs.{}.steps[{}]", notice.job, notice.step);
    let uses = &notice.uses;
    match &notice.kind {
        NoticeKind::LatestAlias => {
            format!("{location}: {uses} uses the mutable 'latest' alias")
        }
        NoticeKind::MissingRef => {
            format!("{location}: {uses} has no tag/ref and runs from the default branch")
        }
        NoticeKind::ManualPin => {
            format!("{location}: {uses} needs a manual pin (no matching tag)")
        }
        NoticeKind::Unresolvable(reason) => format!("{location}: {uses} left as is ({reason})"),
        NoticeKind::Unpatched => {
            format!("{location}: {uses} resolved but its line could not be rewritten")
        }
        NoticeKind::Malformed(reason) => format!("{location}: {reason}"),
    }
}

/// Format one resolved ref: requested ref, commit hash, and the ref that produced it.
pub(super) fn format_resolution(identity: &ActionIdentity, requested: &str, resolved: &Resolved) -> String {
    if resolved.reference == requested {
        format!("{identity}@{requested} {}", resolved.hash)
    } else {
        format!(
            "{identity}@{requested} {} (via {})",
            resolved.hash, resolved.reference
        )
    }
}
