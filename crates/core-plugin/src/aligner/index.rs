//! Shared minimap2 glue for the `mappy` and `mappy_rs` plugins: reference
//! path checks, index construction, and mapping-record conversion.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use core_model::{Alignment, BasecalledRead, Strand};

use crate::PluginError;

/// Options shared by both minimap2-backed aligners. `mappy_rs` adds a
/// worker count on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct IndexOptions {
    /// Prebuilt `.mmi` index or a FASTA the library can index on load.
    pub index: std::path::PathBuf,
    /// minimap2 preset; defaults to `map-ont`.
    #[serde(default)]
    pub preset: Option<String>,
    /// Threads used while loading/building the index (not for mapping).
    #[serde(default = "default_index_threads")]
    pub index_threads: usize,
}

pub(crate) fn default_index_threads() -> usize {
    2
}

const REFERENCE_EXTENSIONS: &[&str] = &["mmi", "fa", "fasta", "fna"];

/// The reference must exist and look like a prebuilt index or FASTA
/// (optionally gzip-compressed) before we hand it to the library.
pub(crate) fn check_reference_path(plugin: &'static str, path: &Path) -> Result<(), PluginError> {
    if !path.exists() {
        return Err(PluginError::InitFailed {
            plugin,
            reason: format!("reference index path does not exist: {}", path.display()),
        });
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let stem = name.strip_suffix(".gz").unwrap_or(&name);
    let accepted = REFERENCE_EXTENSIONS
        .iter()
        .any(|ext| stem.ends_with(&format!(".{ext}")));
    // A compressed prebuilt index is not readable.
    if !accepted || (name.ends_with(".gz") && stem.ends_with(".mmi")) {
        return Err(PluginError::InitFailed {
            plugin,
            reason: format!(
                "reference {} has an unexpected extension, expected one of {:?} (optionally .gz for FASTA)",
                path.display(),
                REFERENCE_EXTENSIONS
            ),
        });
    }
    Ok(())
}

/// A loaded minimap2 index shared across worker threads.
pub(crate) struct ReferenceIndex {
    aligner: Arc<minimap2::Aligner<minimap2::Built>>,
}

impl ReferenceIndex {
    pub(crate) fn load(
        plugin: &'static str,
        options: &IndexOptions,
    ) -> Result<Self, PluginError> {
        check_reference_path(plugin, &options.index)?;
        let builder = minimap2::Aligner::builder();
        let builder = match options.preset.as_deref() {
            None | Some("map-ont") => builder.map_ont(),
            Some("map-hifi") => builder.map_hifi(),
            Some("map-pb") => builder.map_pb(),
            Some(other) => {
                return Err(PluginError::BadOptions {
                    plugin,
                    reason: format!(
                        "unknown preset {other:?}, expected map-ont, map-hifi or map-pb"
                    ),
                });
            }
        };
        let aligner = builder
            .with_index_threads(options.index_threads.max(1))
            .with_index(&options.index, None)
            .map_err(|err| PluginError::InitFailed {
                plugin,
                reason: format!(
                    "failed to load reference index {}: {err}",
                    options.index.display()
                ),
            })?;
        let loaded = Self {
            aligner: Arc::new(aligner),
        };
        info!(
            target: "plugin.mapper",
            index = %options.index.display(),
            contigs = loaded.contig_names().len(),
            "reference_index_loaded"
        );
        Ok(loaded)
    }

    pub(crate) fn share(&self) -> Arc<minimap2::Aligner<minimap2::Built>> {
        self.aligner.clone()
    }

    pub(crate) fn contig_names(&self) -> Vec<String> {
        let n_seq = self.aligner.n_seq();
        let mut names = Vec::with_capacity(n_seq as usize);
        for i in 0..n_seq {
            let Some(seq) = self.aligner.get_seq(i as usize) else {
                continue;
            };
            let name = unsafe { std::ffi::CStr::from_ptr(seq.name) };
            names.push(name.to_string_lossy().into_owned());
        }
        names
    }
}

/// Map one read, converting minimap2 records into pipeline alignments. A
/// mapping failure downgrades the read to unmapped rather than failing the
/// batch.
pub(crate) fn map_read(
    aligner: &minimap2::Aligner<minimap2::Built>,
    read: &BasecalledRead,
) -> Vec<Alignment> {
    match aligner.map(
        read.sequence.as_bytes(),
        false,
        false,
        None,
        None,
        Some(read.read_id.as_bytes()),
    ) {
        Ok(mappings) => mappings.into_iter().filter_map(to_alignment).collect(),
        Err(err) => {
            warn!(
                target: "plugin.mapper",
                read_id = %read.read_id,
                error = %err,
                "mapping_failed"
            );
            Vec::new()
        }
    }
}

fn to_alignment(mapping: minimap2::Mapping) -> Option<Alignment> {
    let contig = mapping.target_name.as_deref()?.to_string();
    Some(Alignment {
        contig,
        strand: match mapping.strand {
            minimap2::Strand::Forward => Strand::Forward,
            minimap2::Strand::Reverse => Strand::Reverse,
        },
        r_st: u64::try_from(mapping.target_start).ok()?,
        r_en: u64::try_from(mapping.target_end).ok()?,
        mapq: mapping.mapq.min(254) as u8,
    })
}
