//! The seam through which decoded values leave the driver.

use std::collections::BTreeMap;

/// Receives every value the driver publishes.
///
/// `value` is `None` when the quantity is currently unknown (invalid decode or not
/// yet reported). `text` is the formatted display string of the value.
pub trait Publisher {
    fn publish(&mut self, path: &str, value: Option<f64>, text: Option<String>);
}

/// One published path.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Option<f64>,
    pub text: Option<String>,
    /// Number of times this path was published.
    pub updates: usize,
}

/// In-memory published state, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct PublishedState {
    entries: BTreeMap<String, Entry>,
}

impl PublishedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    /// The current value of a path, `None` if unknown or never published.
    pub fn value(&self, path: &str) -> Option<f64> {
        self.entries.get(path).and_then(|entry| entry.value)
    }

    pub fn updates(&self, path: &str) -> usize {
        self.entries.get(path).map_or(0, |entry| entry.updates)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }
}

impl Publisher for PublishedState {
    fn publish(&mut self, path: &str, value: Option<f64>, text: Option<String>) {
        let entry = self.entries.entry(path.to_string()).or_insert(Entry {
            value: None,
            text: None,
            updates: 0,
        });
        entry.value = value;
        entry.text = text;
        entry.updates += 1;
    }
}
