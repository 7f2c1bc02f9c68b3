//! # Metadata File
//!
//! Forest metadata is a small set of string key/value pairs persisted as
//! a UTF-8 INI-style file with a single `[metadata]` section:
//!
//! ```text
//! [metadata]
//! format = 1/1
//! key_size = 4
//! last_id = 1031
//! node_size = 128
//! root_ids = 3,982
//! ```
//!
//! Keys are written in sorted order so the file is byte-stable for a
//! given state. Callers may store their own keys alongside the forest's;
//! the whole map is rewritten through the journal at every commit.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub const SECTION: &str = "[metadata]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    values: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('[') || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::FormatProblem(format!(
                    "unparseable metadata line: {line:?}"
                )));
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from(SECTION);
        out.push('\n');
        for (key, value) in &self.values {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Parse an integer-valued key. Absent keys are `None`; present but
    /// non-numeric values are a format problem.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
                Error::FormatProblem(format!("metadata key {key} is not a number: {raw:?}"))
            }),
        }
    }
}
