//! Environment variable snapshots and wildcard selection.
//!
//! Tasks declare which variables affect them by name or by wildcard
//! (`NEXT_PUBLIC_*`). Selection runs against a snapshot taken once per run so
//! every task sees the same values.

use crate::Result;
use regex::Regex;
use std::collections::BTreeMap;

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

/// A sorted map of environment variable names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentVariableMap(BTreeMap<String, String>);

impl EnvironmentVariableMap {
    /// Snapshot the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self(std::env::vars().collect())
    }

    /// Insert or overwrite a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add every entry of `other`, overwriting existing values.
    pub fn union(&mut self, other: &Self) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Remove every name present in `other`.
    pub fn difference(&mut self, other: &Self) {
        for name in other.0.keys() {
            self.0.remove(name);
        }
    }

    /// Sorted variable names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Sorted `NAME=value` pairs, the form that enters a hash.
    #[must_use]
    pub fn to_hashable(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Select the variables matched by `patterns`.
    ///
    /// `*` matches any run of characters, `\*` is a literal star. A leading
    /// `!` turns the pattern into an exclusion; exclusions beat inclusions. A
    /// leading `\!` is a literal `!`.
    pub fn from_wildcards(&self, patterns: &[impl AsRef<str>]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }

        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if let Some(rest) = pattern.strip_prefix('!') {
                exclude.push(wildcard_to_regex(rest));
            } else if let Some(rest) = pattern.strip_prefix("\\!") {
                include.push(wildcard_to_regex(&format!("!{rest}")));
            } else {
                include.push(wildcard_to_regex(pattern));
            }
        }

        let include = compile(&include)?;
        let exclude = compile(&exclude)?;

        let selected = self
            .0
            .iter()
            .filter(|(name, _)| include.as_ref().is_some_and(|re| re.is_match(name)))
            .filter(|(name, _)| !exclude.as_ref().is_some_and(|re| re.is_match(name)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self(selected))
    }
}

impl From<BTreeMap<String, String>> for EnvironmentVariableMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentVariableMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn compile(alternatives: &[String]) -> Result<Option<Regex>> {
    if alternatives.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(&format!("^({})$", alternatives.join("|")))?))
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::new();
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c == WILDCARD_ESCAPE && chars.peek() == Some(&WILDCARD) {
            chars.next();
            literal.push(WILDCARD);
        } else if c == WILDCARD {
            out.push_str(&regex::escape(&literal));
            literal.clear();
            if !out.ends_with(REGEX_WILDCARD_SEGMENT) {
                out.push_str(REGEX_WILDCARD_SEGMENT);
            }
        } else {
            literal.push(c);
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}
