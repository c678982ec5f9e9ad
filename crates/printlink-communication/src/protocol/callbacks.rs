//! Line-matching callback tables
//!
//! An ordered list of `(matcher, action)` pairs. Every matching entry is
//! returned in registration order; the caller runs them and any of them may
//! stop the line from reaching generic listeners. Entries can be added and
//! removed at runtime for scoped exchanges such as SD file deletion.

/// How a key is compared with a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Line starts with the key
    StartsWith(String),
    /// Line contains the key anywhere
    Contains(String),
}

impl Matcher {
    /// Match lines beginning with `key`
    pub fn starts_with(key: impl Into<String>) -> Self {
        Matcher::StartsWith(key.into())
    }

    /// Match lines containing `key`
    pub fn contains(key: impl Into<String>) -> Self {
        Matcher::Contains(key.into())
    }

    /// Whether `line` matches
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::StartsWith(key) => line.starts_with(key.as_str()),
            Matcher::Contains(key) => line.contains(key.as_str()),
        }
    }

    /// The literal key
    pub fn key(&self) -> &str {
        match self {
            Matcher::StartsWith(key) | Matcher::Contains(key) => key,
        }
    }
}

/// Ordered `(matcher, action)` table
#[derive(Debug, Clone)]
pub struct LineCallbacks<A> {
    entries: Vec<(Matcher, A)>,
}

impl<A> Default for LineCallbacks<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A: Clone + PartialEq> LineCallbacks<A> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn add(&mut self, matcher: Matcher, action: A) {
        self.entries.push((matcher, action));
    }

    /// Remove every entry with this key and action. Returns how many went.
    pub fn remove(&mut self, key: &str, action: &A) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(matcher, existing)| !(matcher.key() == key && existing == action));
        before - self.entries.len()
    }

    /// Whether an entry with this key and action is registered
    pub fn contains(&self, key: &str, action: &A) -> bool {
        self.entries
            .iter()
            .any(|(matcher, existing)| matcher.key() == key && existing == action)
    }

    /// Actions of every entry matching `line`, in registration order
    pub fn matching(&self, line: &str) -> Vec<A> {
        self.entries
            .iter()
            .filter(|(matcher, _)| matcher.matches(line))
            .map(|(_, action)| action.clone())
            .collect()
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
