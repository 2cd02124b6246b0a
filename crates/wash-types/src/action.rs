//! The capability vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the fixed operations an entry may support.
///
/// The vocabulary is closed: plugins declare a subset of these per entry,
/// and invoking anything outside the declared set is an error rather than
/// a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    List,
    Read,
    Stream,
    Exec,
    Metadata,
    Write,
    Delete,
    Signal,
}

impl Action {
    /// All actions, in declaration order.
    pub const ALL: [Action; 8] = [
        Action::List,
        Action::Read,
        Action::Stream,
        Action::Exec,
        Action::Metadata,
        Action::Write,
        Action::Delete,
        Action::Signal,
    ];

    /// The wire name of this action (what plugins receive as argv[1]).
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Read => "read",
            Action::Stream => "stream",
            Action::Exec => "exec",
            Action::Metadata => "metadata",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::Signal => "signal",
        }
    }

    /// Whether results of this action may be retained in the operation cache.
    ///
    /// `stream` hands out live handles and `exec` has side effects, so only
    /// the three pure fetch actions qualify.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Action::List | Action::Read | Action::Metadata)
    }

    /// Whether this action mutates the entry (and must invalidate caches).
    pub fn is_mutation(&self) -> bool {
        matches!(self, Action::Write | Action::Delete | Action::Signal)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Error returned when parsing an action name that is not in the vocabulary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

/// The set of actions an entry supports.
///
/// Fixed for the entry's lifetime; backed by a bitmask since the vocabulary
/// is closed and small.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionSet(u8);

impl ActionSet {
    /// The empty set.
    pub const EMPTY: ActionSet = ActionSet(0);

    /// Build a set from a slice of actions.
    pub fn new(actions: &[Action]) -> Self {
        let mut set = ActionSet::EMPTY;
        for a in actions {
            set.insert(*a);
        }
        set
    }

    /// Parse a set from wire names, e.g. `["list", "read"]`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownAction> {
        let mut set = ActionSet::EMPTY;
        for name in names {
            set.insert(name.as_ref().parse()?);
        }
        Ok(set)
    }

    fn bit(action: Action) -> u8 {
        1 << (action as u8)
    }

    fn insert(&mut self, action: Action) {
        self.0 |= Self::bit(action);
    }

    /// Membership test; capability dispatch gates on this.
    pub fn contains(&self, action: Action) -> bool {
        self.0 & Self::bit(action) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        Action::ALL.into_iter().filter(|a| self.contains(*a))
    }

    /// Wire names of the members, for re-serialization and display.
    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(|a| a.as_str()).collect()
    }
}

impl fmt::Debug for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        let mut set = ActionSet::EMPTY;
        for a in iter {
            set.insert(a);
        }
        set
    }
}
