//! Action identities and the references that invoke them.

use std::fmt;

/// An `owner/name` pair identifying a repository that hosts an action.
///
/// Equality is case-sensitive on the normalized `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionIdentity {
    owner: String,
    name: String,
}

impl ActionIdentity {
    /// Parse `owner/name`, ignoring any trailing sub-path segments.
    ///
    /// Returns `None` if either the owner or the name is empty.
    pub fn parse(action: &str) -> Option<Self> {
        let mut segments = action.split('/');
        let owner = segments.next()?.trim();
        let name = segments.next()?.trim();
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ActionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Why a `uses` value could not be turned into an [`ActionReference`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// No `@ref` suffix: the action runs from its mutable default branch.
    #[error("action without tag/ref: {0}")]
    MissingRef(String),

    #[error("more than one '@' separator in {0}")]
    MultipleSeparators(String),

    #[error("expected owner/name before '@' in {0}")]
    InvalidIdentity(String),

    #[error("empty ref after '@' in {0}")]
    EmptyRef(String),
}

/// A parsed `owner/name[/path]@ref` invocation.
///
/// `action` keeps the full path as written (including any sub-directory),
/// so a pinned rewrite preserves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReference {
    pub identity: ActionIdentity,
    pub action: String,
    pub reference: String,
}

impl ActionReference {
    /// Parse a raw `uses` value.
    pub fn parse(uses: &str) -> Result<Self, ReferenceError> {
        let mut parts = uses.split('@');
        let action = parts.next().unwrap_or_default();
        let Some(reference) = parts.next() else {
            return Err(ReferenceError::MissingRef(uses.to_string()));
        };
        if parts.next().is_some() {
            return Err(ReferenceError::MultipleSeparators(uses.to_string()));
        }
        if reference.is_empty() {
            return Err(ReferenceError::EmptyRef(uses.to_string()));
        }
        let identity = ActionIdentity::parse(action)
            .ok_or_else(|| ReferenceError::InvalidIdentity(uses.to_string()))?;

        Ok(Self {
            identity,
            action: action.to_string(),
            reference: reference.to_string(),
        })
    }

    /// The unit of resolution work this reference maps to.
    pub fn key(&self) -> PinKey {
        PinKey::new(self.identity.clone(), self.reference.as_str())
    }
}

/// `(identity, ref)`: two pin requests are the same work iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinKey {
    pub identity: ActionIdentity,
    pub reference: String,
}

impl PinKey {
    pub fn new(identity: ActionIdentity, reference: impl Into<String>) -> Self {
        Self {
            identity,
            reference: reference.into(),
        }
    }
}

impl fmt::Display for PinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.reference)
    }
}
