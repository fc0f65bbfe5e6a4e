//! Experiment configuration: loading, validation, and condition lookup.
//!
//! The file model ([`file::ExperimentFile`]) is a faithful serde mirror of
//! the TOML on disk; this module validates it (collecting *every* problem,
//! not just the first) and produces the immutable [`Experiment`] used on
//! the hot path. [`ConditionResolver`] binds an experiment to a flow-cell
//! layout and answers `condition_for(channel, barcode)` in O(1).
//!
//! Lifecycle: an [`Experiment`] never changes after construction. Reload is
//! a whole-object replacement through [`ConfigHandle`]; readers holding the
//! previous `Arc` finish their batch against the old policy.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use toml::Table;
use tracing::warn;

use core_model::{Action, Channel, ChannelRegionMap, Decision, FlowcellLayout, SplitAxis};
use core_targets::TargetIndex;

pub mod file;

pub use file::{ConditionFile, ExperimentFile, TargetsField};

/// Barcode condition that receives reads the caller could not classify.
pub const BARCODE_UNCLASSIFIED: &str = "unclassified";
/// Barcode condition that receives classified reads with no dedicated table.
pub const BARCODE_CLASSIFIED: &str = "classified";

const DEFAULT_UNBLOCK_DURATION: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration:{}", format_problems(.0))]
    Invalid(Vec<Problem>),
}

/// One validation failure, addressed by the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn format_problems(problems: &[Problem]) -> String {
    let mut out = String::new();
    for problem in problems {
        out.push_str("\n  - ");
        out.push_str(&problem.to_string());
    }
    out
}

/// Plugin choice plus its verbatim options table, passed through untouched
/// to the plugin constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSelector {
    pub name: String,
    pub options: Table,
}

/// Decision→action lookup for one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTable {
    pub single_on: Action,
    pub multi_on: Action,
    pub single_off: Action,
    pub multi_off: Action,
    pub no_seq: Action,
    pub no_map: Action,
    pub above_max_chunks: Action,
    pub below_min_chunks: Action,
}

impl ActionTable {
    pub fn action_for(&self, decision: Decision) -> Action {
        match decision {
            Decision::SingleOn => self.single_on,
            Decision::MultiOn => self.multi_on,
            Decision::SingleOff => self.single_off,
            Decision::MultiOff => self.multi_off,
            Decision::NoSeq => self.no_seq,
            Decision::NoMap => self.no_map,
            Decision::AboveMaxChunks => self.above_max_chunks,
            Decision::BelowMinChunks => self.below_min_chunks,
        }
    }
}

/// The unit of policy: a region of the flow cell or a barcode.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub name: String,
    /// Observational condition: decisions are computed for statistics but
    /// the dispatched action is always `proceed`.
    pub control: bool,
    pub min_chunks: u32,
    pub max_chunks: u32,
    pub targets: TargetIndex,
    pub actions: ActionTable,
}

/// Validated, immutable experiment description.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub split_axis: SplitAxis,
    pub channels: Option<u32>,
    pub unblock_duration: f64,
    pub caller: PluginSelector,
    pub mapper: PluginSelector,
    pub regions: Vec<Condition>,
    pub barcodes: BTreeMap<String, Condition>,
}

impl Experiment {
    /// Read, parse and validate an experiment file. Target file paths are
    /// resolved relative to the configuration file's directory.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let parsed = ExperimentFile::from_path(path)?;
        Self::from_file(parsed, path.parent())
    }

    pub fn from_file(
        file: ExperimentFile,
        base_dir: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        let split_axis = match file.split_axis {
            None => SplitAxis::default(),
            Some(raw) => SplitAxis::try_from(raw).unwrap_or_else(|err| {
                problems.push(Problem {
                    field: "split_axis".to_string(),
                    reason: err.to_string(),
                });
                SplitAxis::default()
            }),
        };

        if let Some(0) = file.channels {
            problems.push(Problem {
                field: "channels".to_string(),
                reason: "channel count override must be positive".to_string(),
            });
        }

        let unblock_duration = file.unblock_duration.unwrap_or(DEFAULT_UNBLOCK_DURATION);
        if !unblock_duration.is_finite() || unblock_duration <= 0.0 {
            problems.push(Problem {
                field: "unblock_duration".to_string(),
                reason: format!("must be a positive number of seconds, got {unblock_duration}"),
            });
        }

        let caller = take_selector("caller_settings", &file.caller_settings, &mut problems);
        let mapper = take_selector("mapper_settings", &file.mapper_settings, &mut problems);

        let mut regions = Vec::with_capacity(file.regions.len());
        for (index, condition) in file.regions.iter().enumerate() {
            let field = format!("regions[{index}]");
            if condition.name.is_none() {
                problems.push(Problem {
                    field: format!("{field}.name"),
                    reason: "missing required key".to_string(),
                });
            }
            if let Some(condition) =
                build_condition(&field, condition, condition.name.clone(), base_dir, &mut problems)
            {
                regions.push(condition);
            }
        }

        let mut barcodes = BTreeMap::new();
        for (key, condition) in &file.barcodes {
            let field = format!("barcodes.{key}");
            let name = condition.name.clone().unwrap_or_else(|| key.clone());
            if let Some(condition) =
                build_condition(&field, condition, Some(name), base_dir, &mut problems)
            {
                barcodes.insert(key.clone(), condition);
            }
        }

        if file.barcodes.is_empty() {
            if file.regions.is_empty() {
                problems.push(Problem {
                    field: "regions".to_string(),
                    reason: "at least one region is required when barcoding is disabled"
                        .to_string(),
                });
            }
        } else {
            for required in [BARCODE_CLASSIFIED, BARCODE_UNCLASSIFIED] {
                if !file.barcodes.contains_key(required) {
                    problems.push(Problem {
                        field: format!("barcodes.{required}"),
                        reason: "required barcode condition is missing".to_string(),
                    });
                }
            }
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        // take_selector only returns None after pushing a problem.
        let (Some(caller), Some(mapper)) = (caller, mapper) else {
            unreachable!("selector problems reported above");
        };

        Ok(Self {
            split_axis,
            channels: file.channels,
            unblock_duration,
            caller,
            mapper,
            regions,
            barcodes,
        })
    }

    pub fn barcoding_enabled(&self) -> bool {
        !self.barcodes.is_empty()
    }

    /// All conditions, regions first, in a stable order.
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.regions.iter().chain(self.barcodes.values())
    }

    /// Cross-check every referenced target contig against the contig names
    /// of the loaded reference.
    pub fn validate_reference_contigs(
        &self,
        reference: &HashSet<String>,
    ) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        for condition in self.conditions() {
            for contig in condition.targets.contigs() {
                if !reference.contains(contig) {
                    problems.push(Problem {
                        field: format!("condition {:?}", condition.name),
                        reason: format!("target contig {contig:?} is not in the reference"),
                    });
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn take_selector(
    field: &str,
    table: &Table,
    problems: &mut Vec<Problem>,
) -> Option<PluginSelector> {
    match table.len() {
        0 => {
            problems.push(Problem {
                field: field.to_string(),
                reason: "exactly one plugin sub-table is required".to_string(),
            });
            None
        }
        1 => {
            let (name, value) = table.iter().next()?;
            match value.as_table() {
                Some(options) => Some(PluginSelector {
                    name: name.clone(),
                    options: options.clone(),
                }),
                None => {
                    problems.push(Problem {
                        field: format!("{field}.{name}"),
                        reason: "plugin options must be a table".to_string(),
                    });
                    None
                }
            }
        }
        n => {
            let names: Vec<&str> = table.keys().map(String::as_str).collect();
            problems.push(Problem {
                field: field.to_string(),
                reason: format!("expected exactly one plugin sub-table, got {n}: {names:?}"),
            });
            None
        }
    }
}

fn build_condition(
    field: &str,
    file: &ConditionFile,
    name: Option<String>,
    base_dir: Option<&Path>,
    problems: &mut Vec<Problem>,
) -> Option<Condition> {
    let before = problems.len();

    let min_chunks = require(problems, field, "min_chunks", file.min_chunks);
    let max_chunks = require(problems, field, "max_chunks", file.max_chunks);
    if let (Some(min), Some(max)) = (min_chunks, max_chunks)
        && min > max
    {
        problems.push(Problem {
            field: format!("{field}.min_chunks"),
            reason: format!("min_chunks {min} exceeds max_chunks {max}"),
        });
    }

    let targets = match &file.targets {
        None => {
            problems.push(Problem {
                field: format!("{field}.targets"),
                reason: "missing required key".to_string(),
            });
            None
        }
        Some(TargetsField::Inline(entries)) => match TargetIndex::from_inline(entries) {
            Ok(index) => Some(index),
            Err(err) => {
                problems.push(Problem {
                    field: format!("{field}.targets"),
                    reason: err.to_string(),
                });
                None
            }
        },
        Some(TargetsField::Path(path)) => {
            let resolved = match base_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            };
            match TargetIndex::from_path(&resolved) {
                Ok(index) => Some(index),
                Err(err) => {
                    problems.push(Problem {
                        field: format!("{field}.targets"),
                        reason: err.to_string(),
                    });
                    None
                }
            }
        }
    };

    let actions = build_action_table(field, file, problems);

    if problems.len() > before {
        return None;
    }
    Some(Condition {
        name: name?,
        control: file.control,
        min_chunks: min_chunks?,
        max_chunks: max_chunks?,
        targets: targets?,
        actions: actions?,
    })
}

fn require<T: Copy>(
    problems: &mut Vec<Problem>,
    field: &str,
    key: &str,
    value: Option<T>,
) -> Option<T> {
    if value.is_none() {
        problems.push(Problem {
            field: format!("{field}.{key}"),
            reason: "missing required key".to_string(),
        });
    }
    value
}

fn build_action_table(
    field: &str,
    file: &ConditionFile,
    problems: &mut Vec<Problem>,
) -> Option<ActionTable> {
    let mut parse = |key: &str, value: &Option<String>, default: Option<Action>| {
        match value {
            Some(token) => match token.parse::<Action>() {
                Ok(action) => Some(action),
                Err(err) => {
                    problems.push(Problem {
                        field: format!("{field}.{key}"),
                        reason: err.to_string(),
                    });
                    None
                }
            },
            None => {
                if default.is_none() {
                    problems.push(Problem {
                        field: format!("{field}.{key}"),
                        reason: "missing required key".to_string(),
                    });
                }
                default
            }
        }
    };

    let single_on = parse("single_on", &file.single_on, None);
    let multi_on = parse("multi_on", &file.multi_on, None);
    let single_off = parse("single_off", &file.single_off, None);
    let multi_off = parse("multi_off", &file.multi_off, None);
    let no_seq = parse("no_seq", &file.no_seq, None);
    let no_map = parse("no_map", &file.no_map, None);
    let above_max_chunks =
        parse("above_max_chunks", &file.above_max_chunks, Some(Action::Unblock));
    let below_min_chunks =
        parse("below_min_chunks", &file.below_min_chunks, Some(Action::Proceed));

    Some(ActionTable {
        single_on: single_on?,
        multi_on: multi_on?,
        single_off: single_off?,
        multi_off: multi_off?,
        no_seq: no_seq?,
        no_map: no_map?,
        above_max_chunks: above_max_chunks?,
        below_min_chunks: below_min_chunks?,
    })
}

/// Binds an experiment to a flow-cell layout: O(1) channel→condition lookup.
pub struct ConditionResolver {
    experiment: Arc<Experiment>,
    regions: Option<ChannelRegionMap>,
}

impl ConditionResolver {
    pub fn new(
        experiment: Arc<Experiment>,
        layout: &FlowcellLayout,
    ) -> Result<Self, ConfigError> {
        if experiment.regions.is_empty() && experiment.barcodes.is_empty() {
            return Err(ConfigError::Invalid(vec![Problem {
                field: "regions".to_string(),
                reason: "experiment has no conditions".to_string(),
            }]));
        }
        let regions = if experiment.regions.is_empty() {
            None
        } else {
            let map = layout
                .split(experiment.split_axis, experiment.regions.len())
                .map_err(|err| {
                    ConfigError::Invalid(vec![Problem {
                        field: "regions".to_string(),
                        reason: err.to_string(),
                    }])
                })?;
            Some(map)
        };
        Ok(Self { experiment, regions })
    }

    pub fn experiment(&self) -> &Arc<Experiment> {
        &self.experiment
    }

    /// Total, deterministic condition lookup. A configured barcode condition
    /// always wins over the channel's region; unknown barcode names fall to
    /// `classified`, an absent barcode call to `unclassified`.
    pub fn condition_for(&self, channel: Channel, barcode: Option<&str>) -> &Condition {
        if self.experiment.barcoding_enabled() {
            let name = barcode.unwrap_or(BARCODE_UNCLASSIFIED);
            if let Some(condition) = self.experiment.barcodes.get(name) {
                return condition;
            }
            let fallback = if name == BARCODE_UNCLASSIFIED {
                BARCODE_UNCLASSIFIED
            } else {
                BARCODE_CLASSIFIED
            };
            if let Some(condition) = self.experiment.barcodes.get(fallback) {
                return condition;
            }
        }
        let region = self
            .regions
            .as_ref()
            .and_then(|map| map.region_of(channel))
            .unwrap_or_else(|| {
                warn!(target: "config", channel, "channel outside flow-cell layout");
                0
            });
        self.experiment
            .regions
            .get(region)
            .or_else(|| self.experiment.regions.first())
            .or_else(|| self.experiment.barcodes.values().next())
            .expect("constructor rejects experiments with no conditions")
    }
}

/// Shared, atomically replaceable configuration handle. Readers clone the
/// inner `Arc` once per batch; a reload swaps the whole experiment.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Experiment>>>,
}

impl ConfigHandle {
    pub fn new(experiment: Experiment) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(experiment))),
        }
    }

    pub fn load(&self) -> Arc<Experiment> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the experiment wholesale, returning the previous one.
    pub fn replace(&self, experiment: Experiment) -> Arc<Experiment> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, Arc::new(experiment))
    }
}
