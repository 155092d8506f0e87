//! Reference classification: which step invocations need pinning.
//!
//! Walks `jobs.<id>.steps[].uses` of a parsed workflow and sorts every
//! invocation into one category. Pure: no network or disk I/O.

use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::Value;

use crate::model::{ActionReference, PinKey, ReferenceError, Tally};

/// The mutable alias flagged (but still resolved) when used as a ref.
pub const LATEST_ALIAS: &str = "latest";

static COMMIT_HASH_RE: OnceLock<Regex> = OnceLock::new();

fn commit_hash_re() -> &'static Regex {
    COMMIT_HASH_RE.get_or_init(|| Regex::new(r"^[a-f0-9]{40}$").unwrap())
}

/// Whether `reference` is a full 40-character lowercase commit hash.
pub fn is_commit_hash(reference: &str) -> bool {
    commit_hash_re().is_match(reference)
}

/// What to do with one `uses` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Local path, container image, or excluded by configuration.
    Skip,

    /// Already references a commit hash.
    AlreadyPinned,

    /// Has a tag or branch ref that can be resolved to a hash.
    NeedsResolution {
        reference: ActionReference,
        uses_latest: bool,
    },

    /// No `@ref`: runs from the mutable default branch, nothing to pin to.
    MissingRef,

    Malformed(ReferenceError),
}

/// One step invocation as found in the document.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job: String,
    pub step: usize,
    pub uses: String,
    pub classification: Classification,
}

impl Invocation {
    /// The parsed reference, for invocations that need resolution.
    pub fn reference(&self) -> Option<&ActionReference> {
        match &self.classification {
            Classification::NeedsResolution { reference, .. } => Some(reference),
            _ => None,
        }
    }
}

/// Classifies invocations against a list of exclusion substrings.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    skip: Vec<String>,
}

impl Classifier {
    pub fn new(skip: Vec<String>) -> Self {
        let skip = skip.into_iter().filter(|s| !s.is_empty()).collect();
        Self { skip }
    }

    /// Classify one raw `uses` value.
    pub fn classify(&self, uses: &str) -> Classification {
        if self.should_skip(uses) {
            return Classification::Skip;
        }

        match ActionReference::parse(uses) {
            Ok(reference) if is_commit_hash(&reference.reference) => {
                Classification::AlreadyPinned
            }
            Ok(reference) => {
                let uses_latest = reference.reference == LATEST_ALIAS;
                Classification::NeedsResolution {
                    reference,
                    uses_latest,
                }
            }
            Err(ReferenceError::MissingRef(_)) => Classification::MissingRef,
            Err(e) => Classification::Malformed(e),
        }
    }

    /// Classify every step invocation in a parsed workflow, in document order.
    ///
    /// Documents without a `jobs` mapping yield nothing.
    pub fn classify_document(&self, document: &Value) -> Vec<Invocation> {
        let Some(jobs) = document.get("jobs").and_then(Value::as_mapping) else {
            return Vec::new();
        };

        let mut invocations = Vec::new();
        for (job_id, job) in jobs {
            let Some(steps) = job.get("steps").and_then(Value::as_sequence) else {
                continue;
            };
            let job_id = job_key(job_id);
            for (index, step) in steps.iter().enumerate() {
                let Some(uses) = step.get("uses").and_then(Value::as_str) else {
                    continue;
                };
                if uses.is_empty() {
                    continue;
                }
                invocations.push(Invocation {
                    job: job_id.clone(),
                    step: index,
                    uses: uses.to_string(),
                    classification: self.classify(uses),
                });
            }
        }
        invocations
    }

    fn should_skip(&self, uses: &str) -> bool {
        if uses.starts_with("./") || uses.starts_with("../") || uses.starts_with("docker://") {
            return true;
        }
        self.skip.iter().any(|pattern| uses.contains(pattern.as_str()))
    }
}

/// Render a job key; non-string keys are unusual but legal YAML.
fn job_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Every pin request in the document, duplicates included.
pub fn pin_requests(invocations: &[Invocation]) -> Vec<PinKey> {
    invocations
        .iter()
        .filter_map(Invocation::reference)
        .map(ActionReference::key)
        .collect()
}

/// Count classification outcomes.
///
/// Resolution-dependent fields (`pinned`, `unresolved`, failures) are left
/// for the caller to fill in once results are known.
pub fn tally(invocations: &[Invocation]) -> Tally {
    let mut tally = Tally {
        found: invocations.len(),
        ..Tally::default()
    };
    for invocation in invocations {
        match &invocation.classification {
            Classification::Skip => tally.skipped += 1,
            Classification::AlreadyPinned => tally.already_pinned += 1,
            Classification::NeedsResolution { uses_latest, .. } => {
                if *uses_latest {
                    tally.with_latest += 1;
                }
            }
            Classification::MissingRef => tally.without_ref += 1,
            Classification::Malformed(_) => tally.malformed += 1,
        }
    }
    tally
}
