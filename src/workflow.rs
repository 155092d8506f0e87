//! Workflow processing: classify, resolve, and patch whole documents.
//!
//! A document goes read → parse → classify → schedule → patch, and is
//! written back only when the patch changed it. A repository is every
//! `*.yml`/`*.yaml` file directly under `.github/workflows`.

use std::{
    collections::HashSet,
    fs, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use jiff::civil::Date;
use serde_yaml::Value;

use crate::classify::{self, Classification, Classifier, Invocation};
use crate::model::Tally;
use crate::patch::{self, OccurrencePolicy};
use crate::resolve::{ResolveError, Resolver};
use crate::schedule::Scheduler;

/// Where workflows live, relative to a repository root.
pub const WORKFLOWS_DIR: &str = ".github/workflows";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Something about one invocation the user should look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// Uses the mutable `latest` alias.
    LatestAlias,

    /// No `@ref` at all.
    MissingRef,

    /// A semantic version with no tag; annotated for a manual pin.
    ManualPin,

    /// Resolution failed; the line was left alone.
    Unresolvable(String),

    /// Resolved, but the value's line could not be rewritten.
    Unpatched,

    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub job: String,
    pub step: usize,
    pub uses: String,
    pub kind: NoticeKind,
}

impl Notice {
    fn new(invocation: &Invocation, kind: NoticeKind) -> Self {
        Self {
            job: invocation.job.clone(),
            step: invocation.step,
            uses: invocation.uses.clone(),
            kind,
        }
    }
}

/// The result of pinning one document.
#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub text: String,
    pub changed: bool,
    pub tally: Tally,
    pub notices: Vec<Notice>,
}

/// The result of pinning every workflow in a repository.
#[derive(Debug, Default)]
pub struct RepositoryOutcome {
    /// Set when the repository has no workflows directory.
    pub missing_workflows: bool,

    pub documents: Vec<(PathBuf, DocumentOutcome)>,

    /// Files that could not be read, parsed, or written. The rest are still processed.
    pub failures: Vec<DocumentError>,

    pub tally: Tally,
}

/// Pins workflow documents with a shared resolver.
pub struct Pinner {
    resolver: Resolver,
    classifier: Classifier,
    workers: NonZeroUsize,
    policy: OccurrencePolicy,
}

impl Pinner {
    pub fn new(resolver: Resolver, classifier: Classifier) -> Self {
        Self {
            resolver,
            classifier,
            workers: Scheduler::default_workers(),
            policy: OccurrencePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: OccurrencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pin one document's text. Only resolution touches the outside world.
    pub fn pin_document(&self, text: &str, date: Date) -> Result<DocumentOutcome, serde_yaml::Error> {
        let document: Value = serde_yaml::from_str(text)?;
        let invocations = self.classifier.classify_document(&document);

        let requests = classify::pin_requests(&invocations);
        let results = Scheduler::new(&self.resolver, self.workers).run(&requests);

        let ops = patch::plan(&invocations, &results, date);
        let patched = patch::apply(text, &ops, self.policy);

        let mut tally = classify::tally(&invocations);
        tally.pinned = patched.pinned;
        tally.unresolved = patched.annotated;

        let mut flagged = HashSet::new();
        let mut notices = Vec::new();
        for invocation in &invocations {
            match &invocation.classification {
                Classification::MissingRef => {
                    notices.push(Notice::new(invocation, NoticeKind::MissingRef));
                }
                Classification::Malformed(e) => {
                    notices.push(Notice::new(invocation, NoticeKind::Malformed(e.to_string())));
                }
                Classification::NeedsResolution {
                    reference,
                    uses_latest,
                } => {
                    if *uses_latest {
                        notices.push(Notice::new(invocation, NoticeKind::LatestAlias));
                    }
                    match results.get(&reference.key()) {
                        Some(Err(e @ ResolveError::Unresolved { .. })) => {
                            if flagged.insert(invocation.uses.as_str()) {
                                tracing::debug!(uses = %invocation.uses, error = %e, "needs a manual pin");
                                notices.push(Notice::new(invocation, NoticeKind::ManualPin));
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(uses = %invocation.uses, error = %e, "could not resolve");
                            tally.skipped += 1;
                            notices.push(Notice::new(
                                invocation,
                                NoticeKind::Unresolvable(e.to_string()),
                            ));
                        }
                        Some(Ok(_)) if patched.unmatched.contains(&invocation.uses) => {
                            tracing::warn!(uses = %invocation.uses, "resolved but no line to rewrite");
                            tally.skipped += 1;
                            notices.push(Notice::new(invocation, NoticeKind::Unpatched));
                        }
                        Some(Ok(_)) | None => {}
                    }
                }
                Classification::Skip | Classification::AlreadyPinned => {}
            }
        }

        Ok(DocumentOutcome {
            changed: patched.changed,
            text: patched.text,
            tally,
            notices,
        })
    }

    /// Pin a workflow file in place. The file is rewritten only if it changed.
    pub fn pin_file(&self, path: &Path, date: Date) -> Result<DocumentOutcome, DocumentError> {
        let text = fs::read_to_string(path).map_err(|source| DocumentError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let outcome = self
            .pin_document(&text, date)
            .map_err(|source| DocumentError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if outcome.changed {
            fs::write(path, &outcome.text).map_err(|source| DocumentError::Write {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::info!(path = %path.display(), pinned = outcome.tally.pinned, "updated workflow");
        } else {
            tracing::debug!(path = %path.display(), "workflow unchanged");
        }

        Ok(outcome)
    }

    /// Pin every workflow under `<root>/.github/workflows`, in file name order.
    ///
    /// Only listing the directory is fatal; per-file failures are collected.
    pub fn pin_repository(&self, root: &Path, date: Date) -> Result<RepositoryOutcome, DocumentError> {
        let dir = root.join(WORKFLOWS_DIR);
        let files = match workflow_files(&dir) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "no workflows directory");
                return Ok(RepositoryOutcome {
                    missing_workflows: true,
                    ..RepositoryOutcome::default()
                });
            }
            Err(source) => return Err(DocumentError::ReadDir { path: dir, source }),
        };

        let mut outcome = RepositoryOutcome::default();
        for path in files {
            match self.pin_file(&path, date) {
                Ok(document) => {
                    outcome.tally += document.tally;
                    outcome.documents.push((path, document));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping workflow");
                    outcome.failures.push(e);
                }
            }
        }
        Ok(outcome)
    }
}

/// Regular `*.yml`/`*.yaml` files directly in `dir`, sorted.
fn workflow_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yml" || e == "yaml");
        if is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use jiff::civil::date;
    use tempfile::TempDir;

    use crate::model::ActionIdentity;
    use crate::patch::MANUAL_PIN_MARKER;
    use crate::resolve::{CloneDepth, CommandError, MirrorCache, MirrorOps, RefKind, RemoteRefs};

    const CHECKOUT_V3: &str = "1111111111111111111111111111111111111111";
    const SETUP_GO_V5: &str = "5555555555555555555555555555555555555555";
    const PINNED: &str = "abc123def456789012345678901234567890abcd";

    /// Remote that knows a fixed set of `owner/name@tag` refs.
    struct FixedRemote(HashMap<String, String>);

    impl RemoteRefs for FixedRemote {
        fn lookup_ref(&self, identity: &ActionIdentity, name: &str, kind: RefKind) -> Option<String> {
            if kind != RefKind::Tag {
                return None;
            }
            self.0.get(&format!("{identity}@{name}")).cloned()
        }
    }

    /// Mirror that clones successfully but knows no refs.
    struct BareMirror;

    fn no_ref(what: &str) -> CommandError {
        CommandError::Failed {
            command: what.to_string(),
            stderr: "not found".into(),
        }
    }

    impl MirrorOps for BareMirror {
        fn clone_shallow(
            &self,
            _identity: &ActionIdentity,
            dest: &Path,
            _depth: CloneDepth,
        ) -> Result<(), CommandError> {
            fs::create_dir_all(dest.join(".git")).unwrap();
            Ok(())
        }

        fn refresh_tags(&self, _dir: &Path) -> Result<(), CommandError> {
            Ok(())
        }

        fn revision_of(&self, _dir: &Path, rev: &str) -> Result<String, CommandError> {
            Err(no_ref(rev))
        }

        fn fetch_tag(&self, _dir: &Path, tag: &str) -> Result<(), CommandError> {
            Err(no_ref(tag))
        }

        fn fetch_branch(&self, _dir: &Path, branch: &str) -> Result<(), CommandError> {
            Err(no_ref(branch))
        }

        fn list_tags_with_prefix(
            &self,
            _dir: &Path,
            _prefix: &str,
        ) -> Result<Vec<String>, CommandError> {
            Ok(Vec::new())
        }
    }

    fn today() -> Date {
        date(2024, 3, 9)
    }

    fn pinner(cache: &TempDir) -> Pinner {
        let remote = FixedRemote(HashMap::from([
            ("actions/checkout@v3".to_string(), CHECKOUT_V3.to_string()),
            ("actions/setup-go@v5".to_string(), SETUP_GO_V5.to_string()),
        ]));
        let resolver = Resolver::new(remote, BareMirror, MirrorCache::new(cache.path()));
        Pinner::new(resolver, Classifier::default()).with_workers(NonZeroUsize::MIN)
    }

    fn steps(uses: &[&str]) -> String {
        let mut text = String::from("name: CI\non: push\njobs:\n  build:\n    runs-on: ubuntu-latest\n    steps:\n");
        for u in uses {
            text.push_str(&format!("      - uses: {u}\n"));
        }
        text
    }

    #[test]
    fn duplicate_invocation_pins_first_occurrence() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["actions/checkout@v3", "actions/checkout@v3"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert!(outcome.changed);
        assert_eq!(
            outcome.text,
            steps(&[
                format!("actions/checkout@{CHECKOUT_V3} # v3 on 2024-03-09").as_str(),
                "actions/checkout@v3",
            ])
        );
        assert_eq!(outcome.tally.found, 2);
        assert_eq!(outcome.tally.pinned, 1);
    }

    #[test]
    fn all_occurrences_policy_pins_every_duplicate() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["actions/checkout@v3", "actions/checkout@v3"]);

        let outcome = pinner(&cache)
            .with_policy(OccurrencePolicy::All)
            .pin_document(&text, today())
            .unwrap();

        assert_eq!(outcome.tally.pinned, 2);
        assert!(!outcome.text.contains("checkout@v3\n"));
    }

    #[test]
    fn local_action_is_skipped_and_text_unchanged() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["./local-action"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.text, text);
        assert_eq!(outcome.tally.skipped, 1);
        assert!(outcome.notices.is_empty());
    }

    #[test]
    fn missing_ref_is_reported_and_left_alone() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["org/action"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.tally.without_ref, 1);
        assert_eq!(outcome.notices.len(), 1);
        assert_eq!(outcome.notices[0].kind, NoticeKind::MissingRef);
        assert_eq!(outcome.notices[0].job, "build");
    }

    #[test]
    fn already_pinned_document_is_a_fixed_point() {
        let cache = TempDir::new().unwrap();
        let text = steps(&[format!("actions/checkout@{PINNED} # v4 on 2024-01-01").as_str()]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.text, text);
        assert_eq!(outcome.tally.already_pinned, 1);
    }

    #[test]
    fn unresolved_semver_is_annotated_once_across_runs() {
        let cache = TempDir::new().unwrap();
        let pinner = pinner(&cache);
        let text = steps(&["org/tool@v1.2.3"]);

        let first = pinner.pin_document(&text, today()).unwrap();
        let second = pinner.pin_document(&first.text, today()).unwrap();

        assert!(first.changed);
        assert!(first.text.contains("org/tool@v1.2.3 # v1.2.3 on 2024-03-09, TODO: pin to a commit hash"));
        assert_eq!(first.tally.unresolved, 1);
        assert_eq!(first.notices[0].kind, NoticeKind::ManualPin);
        assert!(!second.changed);
        assert_eq!(second.text, first.text);
    }

    #[test]
    fn commented_out_duplicate_does_not_take_the_pin() {
        let cache = TempDir::new().unwrap();
        let text = "\
name: CI
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      # - uses: actions/checkout@v3
      - uses: actions/checkout@v3
";

        let outcome = pinner(&cache).pin_document(text, today()).unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.tally.pinned, 1);
        assert!(outcome.text.contains("      # - uses: actions/checkout@v3\n"));
        assert!(outcome.text.contains(&format!(
            "      - uses: actions/checkout@{CHECKOUT_V3} # v3 on 2024-03-09\n"
        )));
        assert!(outcome.notices.is_empty());
    }

    #[test]
    fn quoted_uses_value_is_pinned() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["\"actions/checkout@v3\"", "'actions/setup-go@v5'"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert_eq!(outcome.tally.pinned, 2);
        assert_eq!(outcome.tally.skipped, 0);
        assert!(outcome.text.contains(&format!(
            "uses: \"actions/checkout@{CHECKOUT_V3}\" # v3 on 2024-03-09\n"
        )));
        assert!(outcome.text.contains(&format!(
            "uses: 'actions/setup-go@{SETUP_GO_V5}' # v5 on 2024-03-09\n"
        )));
    }

    #[test]
    fn resolved_but_unrewritable_is_skipped_with_notice() {
        let cache = TempDir::new().unwrap();
        let text = "on: push\njobs: {build: {steps: [{uses: actions/checkout@v3}]}}\n";

        let outcome = pinner(&cache).pin_document(text, today()).unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.tally.pinned, 0);
        assert_eq!(outcome.tally.skipped, 1);
        assert_eq!(outcome.notices.len(), 1);
        assert_eq!(outcome.notices[0].kind, NoticeKind::Unpatched);
    }

    #[test]
    fn duplicate_unresolved_steps_count_one_annotation() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["org/tool@v1.2.3", "org/tool@v1.2.3"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert_eq!(outcome.text.matches(MANUAL_PIN_MARKER).count(), 1);
        assert_eq!(outcome.tally.unresolved, 1);
        let manual: Vec<_> = outcome
            .notices
            .iter()
            .filter(|n| n.kind == NoticeKind::ManualPin)
            .collect();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].step, 0);
    }

    #[test]
    fn unknown_ref_is_skipped_with_notice() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["org/tool@nope", "actions/setup-go@v5"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert!(outcome.changed);
        assert!(outcome.text.contains("uses: org/tool@nope\n"));
        assert_eq!(outcome.tally.pinned, 1);
        assert_eq!(outcome.tally.skipped, 1);
        assert!(matches!(
            outcome.notices[0].kind,
            NoticeKind::Unresolvable(_)
        ));
    }

    #[test]
    fn latest_alias_is_flagged() {
        let cache = TempDir::new().unwrap();
        let text = steps(&["some/tool@latest"]);

        let outcome = pinner(&cache).pin_document(&text, today()).unwrap();

        assert_eq!(outcome.tally.with_latest, 1);
        assert_eq!(outcome.notices[0].kind, NoticeKind::LatestAlias);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let cache = TempDir::new().unwrap();
        assert!(pinner(&cache).pin_document("jobs: [unclosed", today()).is_err());
    }

    #[test]
    fn pin_file_writes_only_when_changed() {
        let cache = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let pinner = pinner(&cache);

        let changed = dir.path().join("ci.yml");
        fs::write(&changed, steps(&["actions/checkout@v3"])).unwrap();
        let unchanged = dir.path().join("local.yml");
        fs::write(&unchanged, steps(&["./local"])).unwrap();

        assert!(pinner.pin_file(&changed, today()).unwrap().changed);
        assert!(!pinner.pin_file(&unchanged, today()).unwrap().changed);

        assert!(fs::read_to_string(&changed).unwrap().contains(CHECKOUT_V3));
        assert_eq!(fs::read_to_string(&unchanged).unwrap(), steps(&["./local"]));
    }

    #[test]
    fn pin_file_reports_missing_file() {
        let cache = TempDir::new().unwrap();
        let err = pinner(&cache)
            .pin_file(&cache.path().join("absent.yml"), today())
            .unwrap_err();
        assert!(matches!(err, DocumentError::Read { .. }));
    }

    #[test]
    fn repository_walk_sums_tallies_in_name_order() {
        let cache = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let workflows = repo.path().join(WORKFLOWS_DIR);
        fs::create_dir_all(workflows.join("nested")).unwrap();
        fs::write(workflows.join("b.yaml"), steps(&["actions/setup-go@v5"])).unwrap();
        fs::write(workflows.join("a.yml"), steps(&["actions/checkout@v3", "org/action"])).unwrap();
        fs::write(workflows.join("broken.yml"), "jobs: [unclosed").unwrap();
        fs::write(workflows.join("README.md"), "uses: actions/checkout@v3\n").unwrap();
        fs::write(workflows.join("nested").join("c.yml"), steps(&["actions/checkout@v3"])).unwrap();

        let outcome = pinner(&cache).pin_repository(repo.path(), today()).unwrap();

        let names: Vec<_> = outcome
            .documents
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.yml", "b.yaml"]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0], DocumentError::Parse { .. }));
        assert_eq!(outcome.tally.found, 3);
        assert_eq!(outcome.tally.pinned, 2);
        assert_eq!(outcome.tally.without_ref, 1);
        assert_eq!(
            fs::read_to_string(workflows.join("README.md")).unwrap(),
            "uses: actions/checkout@v3\n"
        );
    }

    #[test]
    fn repository_without_workflows_is_reported_empty() {
        let cache = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();

        let outcome = pinner(&cache).pin_repository(repo.path(), today()).unwrap();

        assert!(outcome.missing_workflows);
        assert!(outcome.documents.is_empty());
        assert_eq!(outcome.tally, Tally::default());
    }
}
