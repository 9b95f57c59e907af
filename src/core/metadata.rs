/*!
 * Named metadata fields attached to acquisition files
 *
 * Recognized acquisition files expose their header attributes as a flat
 * string map. Person-name values use the DICOM `^` component separator and
 * can be addressed by component (`PatientName.family_name`).
 */

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Anything placeholders can be resolved against
pub trait FieldSource {
    /// Look up a field by name, returning `None` when it is absent or empty
    fn field(&self, name: &str) -> Option<String>;
}

/// Ordered header attributes of one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

impl FieldSource for Metadata {
    fn field(&self, name: &str) -> Option<String> {
        let value = match name.split_once('.') {
            Some((base, component)) => person_name_component(self.get(base)?, component)?,
            None => self.get(name)?.to_string(),
        };
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}

/// Resolve regex named captures as fields. Dots in placeholder names map to
/// underscores because group names cannot contain them.
pub struct CaptureFields<'a>(pub &'a regex::Captures<'a>);

impl FieldSource for CaptureFields<'_> {
    fn field(&self, name: &str) -> Option<String> {
        let group = name.replace('.', "_");
        let value = self.0.name(&group)?.as_str().trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}

/// Extract a component from a `Family^Given^Middle^Prefix^Suffix` value
fn person_name_component(value: &str, component: &str) -> Option<String> {
    let index = match component {
        "family_name" => 0,
        "given_name" => 1,
        "middle_name" => 2,
        "name_prefix" => 3,
        "name_suffix" => 4,
        _ => return None,
    };
    value.split('^').nth(index).map(str::to_string)
}
