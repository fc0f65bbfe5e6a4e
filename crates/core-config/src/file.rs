//! Raw serde model of the experiment description file.
//!
//! Every key is optional at this layer so a single load can report *all*
//! missing and malformed entries instead of stopping at the first serde
//! error. Semantic validation and the conversion into the immutable
//! [`Experiment`](crate::Experiment) live in the crate root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Table;

use crate::ConfigError;

/// Parsed experiment file, structurally faithful to the TOML on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    /// 0 splits rows, 1 splits columns. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_axis: Option<u8>,
    /// Override the flow-cell channel count reported by the instrument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    /// Seconds the ejection voltage is applied per unblock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unblock_duration: Option<f64>,
    /// Exactly one sub-table selecting the caller plugin, keyed by name.
    #[serde(default, skip_serializing_if = "Table::is_empty")]
    pub caller_settings: Table,
    /// Exactly one sub-table selecting the aligner plugin, keyed by name.
    #[serde(default, skip_serializing_if = "Table::is_empty")]
    pub mapper_settings: Table,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<ConditionFile>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub barcodes: BTreeMap<String, ConditionFile>,
}

impl ExperimentFile {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

/// One policy condition as written in the file (a region or a barcode).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Observational condition: classify but never act.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub control: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<TargetsField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_off: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_off: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_seq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above_max_chunks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below_min_chunks: Option<String>,
}

/// Targets are either inline strings or a path to a BED/CSV file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetsField {
    Inline(Vec<String>),
    Path(PathBuf),
}
