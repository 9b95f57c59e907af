/*!
 * Remote column definitions and selector matching
 *
 * ```toml
 * [[columns]]
 * name = "pet"
 * logical_type = "medimage/dicom-series"
 * selector = "PET SWB 8MIN"
 *
 * [[columns]]
 * name = "listmode"
 * logical_type = "medimage/vnd.siemens.pet-list-mode"
 * selector = 'PET/LISTMODE'
 * ```
 */

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::bundle::TransferCandidate;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub logical_type: String,
    /// Regex matched in full against a candidate's label, path or description
    pub selector: String,
}

#[derive(Debug, Deserialize)]
struct ColumnsFile {
    #[serde(default)]
    columns: Vec<ColumnDefinition>,
}

#[derive(Debug)]
struct CompiledColumn {
    definition: ColumnDefinition,
    selector: Regex,
}

/// How a candidate was selected for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    Column(&'a ColumnDefinition),
    AlwaysInclude,
    Skip,
}

/// Columns in declared order plus the always-include logical types
#[derive(Debug, Default)]
pub struct ColumnSet {
    columns: Vec<CompiledColumn>,
    always_include: BTreeSet<String>,
}

impl ColumnSet {
    pub fn new(definitions: Vec<ColumnDefinition>, always_include: &[String]) -> Result<Self> {
        let mut names = HashSet::new();
        let mut columns = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !names.insert(definition.name.clone()) {
                return Err(IngestError::Config(format!(
                    "duplicate column name '{}'",
                    definition.name
                )));
            }
            let selector = Regex::new(&format!("^(?:{})$", definition.selector)).map_err(|e| {
                IngestError::Config(format!(
                    "invalid selector for column '{}': {}",
                    definition.name, e
                ))
            })?;
            columns.push(CompiledColumn {
                definition,
                selector,
            });
        }
        Ok(Self {
            columns,
            always_include: always_include.iter().cloned().collect(),
        })
    }

    /// Load `[[columns]]` from a TOML file
    pub fn from_file(path: &Path, always_include: &[String]) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read columns file {}: {}", path.display(), e))
        })?;
        let file: ColumnsFile = toml::from_str(&contents)?;
        Self::new(file.columns, always_include)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// First column whose selector matches wins; otherwise fall back to the
    /// always-include list by logical type. Resources are not matched by
    /// their series' description.
    pub fn select(&self, candidate: &TransferCandidate) -> Selection<'_> {
        let path = candidate.index_path();
        let description = match candidate.resource {
            None => candidate.description.as_deref(),
            Some(_) => None,
        };
        let keys = [Some(candidate.label.as_str()), Some(path.as_str()), description];
        for column in &self.columns {
            if keys.iter().flatten().any(|k| column.selector.is_match(k)) {
                return Selection::Column(&column.definition);
            }
        }
        if self.always_include.contains(&candidate.logical_type) {
            Selection::AlwaysInclude
        } else {
            Selection::Skip
        }
    }
}
