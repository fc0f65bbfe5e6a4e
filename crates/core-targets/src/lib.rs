//! Target interval index.
//!
//! Each policy condition owns one [`TargetIndex`]: per (contig, strand), a
//! sorted list of merged half-open intervals answering "does this reference
//! coordinate fall inside any target?". Built once at configuration load
//! from inline strings, BED files (six columns) or headerless CSV files,
//! then queried on the hot path with a binary search. A bare contig name is
//! a whole-contig target on both strands and short-circuits any interval
//! lookup on that contig.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use core_model::Strand;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("failed to read target file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("invalid target entry {entry:?}: {reason}")]
    BadEntry { entry: String, reason: String },
}

/// One parsed target before merging. Whole-contig targets are represented
/// as the full coordinate range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub contig: String,
    pub start: u64,
    pub end: u64,
    pub strand: Strand,
}

impl TargetEntry {
    fn whole_contig(contig: &str, strand: Strand) -> Self {
        Self {
            contig: contig.to_string(),
            start: 0,
            end: u64::MAX,
            strand,
        }
    }

    fn is_whole_contig(&self) -> bool {
        self.start == 0 && self.end == u64::MAX
    }
}

/// Parse one inline target string: either `contig` (whole contig, both
/// strands) or `contig,start,end,strand`.
pub fn parse_entry(entry: &str) -> Result<Vec<TargetEntry>, TargetError> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err(TargetError::BadEntry {
            entry: entry.to_string(),
            reason: "empty target".to_string(),
        });
    }
    let fields: Vec<&str> = entry.split(',').map(str::trim).collect();
    match fields.as_slice() {
        [contig] => Ok(vec![
            TargetEntry::whole_contig(contig, Strand::Forward),
            TargetEntry::whole_contig(contig, Strand::Reverse),
        ]),
        [contig, start, end, strand] => {
            let parsed = parse_interval(contig, start, end, strand).map_err(|reason| {
                TargetError::BadEntry {
                    entry: entry.to_string(),
                    reason,
                }
            })?;
            Ok(vec![parsed])
        }
        _ => Err(TargetError::BadEntry {
            entry: entry.to_string(),
            reason: format!("expected 1 or 4 comma-separated fields, got {}", fields.len()),
        }),
    }
}

fn parse_interval(
    contig: &str,
    start: &str,
    end: &str,
    strand: &str,
) -> Result<TargetEntry, String> {
    if contig.is_empty() {
        return Err("empty contig name".to_string());
    }
    let start: u64 = start
        .parse()
        .map_err(|_| format!("bad start coordinate {start:?}"))?;
    let end: u64 = end
        .parse()
        .map_err(|_| format!("bad end coordinate {end:?}"))?;
    if end <= start {
        return Err(format!("end {end} is not past start {start}"));
    }
    let strand = Strand::from_symbol(strand).ok_or_else(|| {
        format!("bad strand {strand:?}, expected + or -")
    })?;
    Ok(TargetEntry {
        contig: contig.to_string(),
        start,
        end,
        strand,
    })
}

/// Merged intervals for one (contig, strand).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ContigTargets {
    /// Whole-contig marker: every coordinate is on-target, intervals unused.
    whole: bool,
    /// Merged, sorted, half-open, non-overlapping.
    intervals: Vec<(u64, u64)>,
}

impl ContigTargets {
    fn contains(&self, coord: u64) -> bool {
        if self.whole {
            return true;
        }
        // Last interval starting at or before coord, if any.
        let idx = self.intervals.partition_point(|&(start, _)| start <= coord);
        idx > 0 && coord < self.intervals[idx - 1].1
    }
}

fn strand_slot(strand: Strand) -> usize {
    match strand {
        Strand::Forward => 0,
        Strand::Reverse => 1,
    }
}

/// Interval index over all targets of one condition. Keyed by contig name
/// with one slot per strand so hot-path queries borrow the contig string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetIndex {
    by_contig: HashMap<String, [ContigTargets; 2]>,
}

impl TargetIndex {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = TargetEntry>,
    {
        let mut grouped: HashMap<(String, Strand), Vec<TargetEntry>> = HashMap::new();
        for entry in entries {
            grouped
                .entry((entry.contig.clone(), entry.strand))
                .or_default()
                .push(entry);
        }
        let mut by_contig: HashMap<String, [ContigTargets; 2]> = HashMap::new();
        for ((contig, strand), mut entries) in grouped {
            let whole = entries.iter().any(TargetEntry::is_whole_contig);
            entries.sort_by_key(|e| (e.start, e.end));
            let mut intervals: Vec<(u64, u64)> = Vec::with_capacity(entries.len());
            for entry in entries {
                match intervals.last_mut() {
                    // Overlapping or adjacent intervals collapse.
                    Some(last) if entry.start <= last.1 => last.1 = last.1.max(entry.end),
                    _ => intervals.push((entry.start, entry.end)),
                }
            }
            by_contig.entry(contig).or_default()[strand_slot(strand)] =
                ContigTargets { whole, intervals };
        }
        Self { by_contig }
    }

    /// Parse a list of inline target strings.
    pub fn from_inline<S: AsRef<str>>(entries: &[S]) -> Result<Self, TargetError> {
        let mut parsed = Vec::new();
        for entry in entries {
            parsed.extend(parse_entry(entry.as_ref())?);
        }
        Ok(Self::from_entries(parsed))
    }

    /// Load targets from a file, dispatching on extension: `.bed` parses as
    /// six-column BED, anything else as headerless CSV.
    pub fn from_path(path: &Path) -> Result<Self, TargetError> {
        let is_bed = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bed"));
        let content = fs::read_to_string(path).map_err(|source| TargetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries = if is_bed {
            parse_bed(path, &content)?
        } else {
            parse_csv(path, &content)?
        };
        Ok(Self::from_entries(entries))
    }

    /// Does `coord` on (contig, strand) fall within any target? Unknown
    /// contigs are off-target, never an error.
    pub fn check_coord(&self, contig: &str, strand: Strand, coord: u64) -> bool {
        self.by_contig
            .get(contig)
            .is_some_and(|slots| slots[strand_slot(strand)].contains(coord))
    }

    /// Contig names referenced by any target, for validation against the
    /// loaded reference.
    pub fn contigs(&self) -> impl Iterator<Item = &str> {
        let mut names: Vec<&str> = self.by_contig.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.by_contig.is_empty()
    }

    /// Number of merged intervals plus whole-contig markers, for summaries.
    pub fn len(&self) -> usize {
        self.by_contig
            .values()
            .flatten()
            .map(|t| if t.whole { 1 } else { t.intervals.len() })
            .sum()
    }
}

impl fmt::Display for TargetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contigs = self.contigs().count();
        write!(f, "{} target(s) across {} contig(s)", self.len(), contigs)
    }
}

fn parse_bed(path: &Path, content: &str) -> Result<Vec<TargetEntry>, TargetError> {
    let mut entries = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line_no = number + 1;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') || line.starts_with("track") {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        // Six columns required: contig, start, end, name, score, strand.
        if fields.len() < 6 {
            return Err(TargetError::Malformed {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("expected 6 tab-separated columns, got {}", fields.len()),
            });
        }
        let entry = parse_interval(fields[0], fields[1], fields[2], fields[5]).map_err(
            |reason| TargetError::Malformed {
                path: path.to_path_buf(),
                line: line_no,
                reason,
            },
        )?;
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_csv(path: &Path, content: &str) -> Result<Vec<TargetEntry>, TargetError> {
    let mut entries = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line_no = number + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = parse_entry(line).map_err(|err| TargetError::Malformed {
            path: path.to_path_buf(),
            line: line_no,
            reason: err.to_string(),
        })?;
        entries.extend(parsed);
    }
    Ok(entries)
}
