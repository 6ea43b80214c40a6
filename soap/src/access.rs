//! Array access terms
//!
//! An access term such as `"i*k"` names the loop iterators that index one
//! array (here `A[i, k]`). Terms are parsed exactly once, when the access is
//! registered, into the ordered list of iterator symbols they denote. Later
//! stages (bound derivation, rank decomposition) only look at the parsed form.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

lazy_static! {
    static ref ITERATOR: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Errors for malformed access terms
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("access term is empty")]
    Empty,

    #[error("'{symbol}' in access term '{term}' is not an iterator name")]
    InvalidIterator { term: String, symbol: String },
}

/// A compound access term parsed into its constituent iterator symbols
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessTerm {
    text: String,
    iterators: Vec<String>,
}

impl AccessTerm {
    /// Parse `"i*k"` (or `"i,k"`) into `[i, k]`.
    ///
    /// Repeated iterators (`"i*i"`, a diagonal access) are kept once, in
    /// first-occurrence order.
    pub fn parse(text: &str) -> Result<Self, AccessError> {
        let mut iterators: Vec<String> = Vec::new();
        for symbol in text.split(|c| c == '*' || c == ',') {
            let symbol = symbol.trim();
            if symbol.is_empty() {
                return Err(AccessError::Empty);
            }
            if !ITERATOR.is_match(symbol) {
                return Err(AccessError::InvalidIterator {
                    term: text.to_string(),
                    symbol: symbol.to_string(),
                });
            }
            if !iterators.iter().any(|it| it == symbol) {
                iterators.push(symbol.to_string());
            }
        }
        Ok(AccessTerm {
            text: iterators.join("*"),
            iterators,
        })
    }

    /// Canonical textual form, iterators joined by `*`.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn iterators(&self) -> &[String] {
        &self.iterators
    }

    pub fn contains(&self, iterator: &str) -> bool {
        self.iterators.iter().any(|it| it == iterator)
    }
}

impl fmt::Display for AccessTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl FromStr for AccessTerm {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessTerm::parse(s)
    }
}

impl Serialize for AccessTerm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for AccessTerm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        AccessTerm::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Per-array access terms: array name -> term text -> parsed term.
///
/// Ordered maps keep every traversal (signatures, decompositions, JSON
/// output) deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayAccesses {
    arrays: BTreeMap<String, BTreeMap<String, AccessTerm>>,
}

impl ArrayAccesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an access of `array`; the term is parsed here, once.
    pub fn register(&mut self, array: &str, term: &str) -> Result<&AccessTerm, AccessError> {
        let parsed = AccessTerm::parse(term)?;
        Ok(self.insert(array, parsed))
    }

    /// Register an already parsed term.
    pub fn insert(&mut self, array: &str, term: AccessTerm) -> &AccessTerm {
        self.arrays
            .entry(array.to_string())
            .or_default()
            .entry(term.as_str().to_string())
            .or_insert(term)
    }

    /// Merge every access of `other` into `self`.
    pub fn extend(&mut self, other: &ArrayAccesses) {
        for (array, terms) in &other.arrays {
            for term in terms.values() {
                self.insert(array, term.clone());
            }
        }
    }

    pub fn arrays(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(|k| k.as_str())
    }

    pub fn terms(&self, array: &str) -> Option<&BTreeMap<String, AccessTerm>> {
        self.arrays.get(array)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, AccessTerm>)> {
        self.arrays.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound_term() {
        let term = AccessTerm::parse("i*k").unwrap();
        assert_eq!(term.iterators(), &["i".to_string(), "k".to_string()]);
        assert_eq!(term.as_str(), "i*k");

        let term = AccessTerm::parse(" i , j ").unwrap();
        assert_eq!(term.as_str(), "i*j");
    }

    #[test]
    fn test_repeated_iterator_kept_once() {
        let term = AccessTerm::parse("i*j*i").unwrap();
        assert_eq!(term.iterators(), &["i".to_string(), "j".to_string()]);
    }

    #[test]
    fn test_invalid_terms() {
        assert_eq!(AccessTerm::parse(""), Err(AccessError::Empty));
        assert_eq!(AccessTerm::parse("i**k"), Err(AccessError::Empty));
        assert!(matches!(
            AccessTerm::parse("i+1"),
            Err(AccessError::InvalidIterator { .. })
        ));
    }

    #[test]
    fn test_register_parses_once() {
        let mut accesses = ArrayAccesses::new();
        accesses.register("A", "i*k").unwrap();
        accesses.register("A", "i*k").unwrap();
        accesses.register("B", "k*j").unwrap();

        assert_eq!(accesses.len(), 2);
        let a_terms = accesses.terms("A").unwrap();
        assert_eq!(a_terms.len(), 1);
        assert!(a_terms["i*k"].contains("k"));
    }

    #[test]
    fn test_serde_transparent_map() {
        let mut accesses = ArrayAccesses::new();
        accesses.register("A", "i*k").unwrap();
        let json = serde_json::to_string(&accesses).unwrap();
        assert_eq!(json, r#"{"A":{"i*k":"i*k"}}"#);
        let back: ArrayAccesses = serde_json::from_str(&json).unwrap();
        assert_eq!(back, accesses);
    }
}
