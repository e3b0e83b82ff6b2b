//! Trailer fields received after the last chunk.

use std::fmt;
use std::sync::{Arc, OnceLock};

/// Header fields that followed the terminating zero-size chunk.
///
/// Names keep the case they were sent with; lookups ignore case. Repeated
/// names are kept in arrival order.
///
/// # Example
///
/// ```
/// use dechunkrs::Trailers;
///
/// let mut trailers = Trailers::new();
/// trailers.append("Expires", "never");
/// trailers.append("X-Digest", "a");
/// trailers.append("x-digest", "b");
///
/// assert_eq!(trailers.get("expires"), Some("never"));
/// assert_eq!(trailers.get_all("X-DIGEST").collect::<Vec<_>>(), ["a", "b"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trailers {
    fields: Vec<(String, String)>,
}

impl Trailers {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping earlier fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Returns the first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// Returns every value of `name` in arrival order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns whether a field called `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns whether no fields were received.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Write-once sink the chunk reader publishes trailers into.
///
/// Clones share the same slot. The slot stays empty until the body is fully
/// decoded, so [`get`](Self::get) returning `Some` also means the body is done.
#[derive(Clone, Default)]
pub struct TrailerSlot {
    inner: Arc<OnceLock<Trailers>>,
}

impl TrailerSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trailers once the body has been fully decoded.
    pub fn get(&self) -> Option<&Trailers> {
        self.inner.get()
    }

    /// Returns whether trailers have been published.
    pub fn is_set(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Publishes `trailers`. Returns `false` if the slot was already filled.
    pub(crate) fn publish(&self, trailers: Trailers) -> bool {
        self.inner.set(trailers).is_ok()
    }
}

impl fmt::Debug for TrailerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrailerSlot").field(&self.inner.get()).finish()
    }
}
