//! Single-threaded minimap2 aligner.

use toml::Table;
use tracing::error;

use crate::{Aligner, PluginError, ReadStream, parse_options};

use super::index::{IndexOptions, ReferenceIndex, map_read};

const PLUGIN: &str = "aligner.mappy";

/// Maps each read inline on the consuming thread. The index is loaded once
/// during [`Aligner::validate`] and shared immutably afterwards.
pub struct MappyAligner {
    options: IndexOptions,
    index: Option<ReferenceIndex>,
}

impl MappyAligner {
    pub fn from_options(options: &Table) -> Result<Self, PluginError> {
        Ok(Self {
            options: parse_options(PLUGIN, options)?,
            index: None,
        })
    }
}

impl Aligner for MappyAligner {
    fn align(&self, reads: ReadStream) -> ReadStream {
        let Some(index) = self.index.as_ref() else {
            error!(
                target: "plugin.mapper",
                "aligner not initialised, reads pass through unmapped"
            );
            return reads;
        };
        let aligner = index.share();
        Box::new(reads.map(move |mut read| {
            if !read.sequence.is_empty() {
                read.alignments = map_read(&aligner, &read);
            }
            read
        }))
    }

    fn validate(&mut self) -> Result<(), PluginError> {
        if self.index.is_none() {
            self.index = Some(ReferenceIndex::load(PLUGIN, &self.options)?);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "minimap2 aligner over {} (single-threaded{})",
            self.options.index.display(),
            if self.initialised() { ", loaded" } else { "" }
        )
    }

    fn initialised(&self) -> bool {
        self.index.is_some()
    }

    fn contigs(&self) -> Option<Vec<String>> {
        self.index.as_ref().map(ReferenceIndex::contig_names)
    }

    fn disconnect(&mut self) {
        self.index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_existing_reference() {
        let mut table = Table::new();
        table.insert(
            "index".to_string(),
            toml::Value::String("/nonexistent/hg38.mmi".to_string()),
        );
        let mut aligner = MappyAligner::from_options(&table).unwrap();
        assert!(!aligner.initialised());
        let err = aligner.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unknown_preset_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("ref.mmi");
        std::fs::write(&index, b"").unwrap();
        let mut table = Table::new();
        table.insert(
            "index".to_string(),
            toml::Value::String(index.display().to_string()),
        );
        table.insert(
            "preset".to_string(),
            toml::Value::String("sr".to_string()),
        );
        let mut aligner = MappyAligner::from_options(&table).unwrap();
        let err = aligner.validate().unwrap_err();
        assert!(err.to_string().contains("unknown preset"));
    }
}
