//! Core data model for the adaptive-sampling pipeline.
//!
//! Everything on the hot path speaks these types: raw signal chunks arriving
//! from the instrument, basecalled reads with their alignments, the decision
//! classification, and the action commands sent back to the instrument.
//! Flow-cell geometry and the channel→region split live in [`flowcell`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod flowcell;

pub use flowcell::{ChannelRegionMap, FlowcellLayout, LayoutError, SplitAxis};

/// 1-based index of a sequencing pore position. Stable for the whole run.
pub type Channel = u32;

/// Instrument-assigned read counter. Monotonically increasing and unique
/// within a channel, but not contiguous.
pub type ReadNumber = u32;

/// One delivery of raw signal from the instrument for an in-progress read.
///
/// Chunks for the same read share `read_id`, `read_number` and `channel`;
/// the signal accumulates on the instrument side while we only ever hold the
/// most recent slice.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadChunk {
    pub channel: Channel,
    pub read_number: ReadNumber,
    /// Opaque UUID-like identifier assigned by the instrument.
    pub read_id: String,
    pub raw_signal: Vec<u8>,
    pub chunk_start_sample: u64,
    pub chunk_length: u64,
    pub median_before: f32,
    pub median: f32,
}

/// Reference strand of an alignment or target interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

impl Strand {
    /// Parse the `+` / `-` text form used by BED and CSV target files.
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Strand::Forward),
            "-" => Some(Strand::Reverse),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> &'static str {
        match self {
            Strand::Forward => "+",
            Strand::Reverse => "-",
        }
    }

    /// Signed form (+1 / -1) as reported by aligner records.
    pub fn as_signed(&self) -> i8 {
        match self {
            Strand::Forward => 1,
            Strand::Reverse => -1,
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A single alignment record attached to a basecalled read.
///
/// Coordinates are zero-based half-open on the reference contig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    pub contig: String,
    pub strand: Strand,
    pub r_st: u64,
    pub r_en: u64,
    pub mapq: u8,
}

impl Alignment {
    /// Reference coordinate of the 3′ end of the alignment on the sequencing
    /// strand: `r_en` for a forward-strand hit, `r_st` for reverse. This is
    /// where the molecule currently sits, given what has already translocated
    /// through the pore, and is the coordinate checked against targets.
    pub fn decision_coord(&self) -> u64 {
        match self.strand {
            Strand::Forward => self.r_en,
            Strand::Reverse => self.r_st,
        }
    }

    /// An alignment record the aligner should never produce. Degenerate
    /// records are reclassified as unmapped rather than trusted.
    pub fn is_degenerate(&self) -> bool {
        self.contig.is_empty() || self.r_en < self.r_st
    }
}

/// A basecalled (and possibly aligned) read travelling through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct BasecalledRead {
    pub read_id: String,
    pub channel: Channel,
    pub read_number: ReadNumber,
    /// Basecaller-reported barcode name. `Some("unclassified")` means the
    /// caller ran barcode detection and found no match; `None` means no
    /// barcode call was attempted.
    pub barcode: Option<String>,
    pub sequence: String,
    pub mean_qscore: f32,
    /// Per-read basecall failure note. The read still flows through the
    /// pipeline (with an empty sequence) so the decision engine can classify
    /// it as `no_seq`.
    pub error: Option<String>,
    pub alignments: Vec<Alignment>,
    pub decision: Option<Decision>,
}

impl BasecalledRead {
    /// An empty-sequence read carrying only identity, used for per-read
    /// basecall failures and by the pass-through caller.
    pub fn unbasecalled(chunk: &ReadChunk, error: Option<String>) -> Self {
        Self {
            read_id: chunk.read_id.clone(),
            channel: chunk.channel,
            read_number: chunk.read_number,
            barcode: None,
            sequence: String::new(),
            mean_qscore: 0.0,
            error,
            alignments: Vec::new(),
            decision: None,
        }
    }
}

/// Classification outcome of one read against one condition's targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    SingleOn,
    MultiOn,
    SingleOff,
    MultiOff,
    NoSeq,
    NoMap,
    AboveMaxChunks,
    BelowMinChunks,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::SingleOn => "single_on",
            Decision::MultiOn => "multi_on",
            Decision::SingleOff => "single_off",
            Decision::MultiOff => "multi_off",
            Decision::NoSeq => "no_seq",
            Decision::NoMap => "no_map",
            Decision::AboveMaxChunks => "above_max_chunks",
            Decision::BelowMinChunks => "below_min_chunks",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command issued (or withheld) for a read after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Reverse the voltage across the pore, ejecting the molecule.
    Unblock,
    /// Let the read finish naturally but stop streaming its chunks.
    StopReceiving,
    /// Wait for one more chunk before re-deciding.
    Proceed,
}

impl Action {
    pub const TOKENS: &[&str] = &["unblock", "stop_receiving", "proceed"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Unblock => "unblock",
            Action::StopReceiving => "stop_receiving",
            Action::Proceed => "proceed",
        }
    }
}

impl FromStr for Action {
    type Err = UnknownActionToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unblock" => Ok(Action::Unblock),
            "stop_receiving" => Ok(Action::StopReceiving),
            "proceed" => Ok(Action::Proceed),
            _ => Err(UnknownActionToken(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action token {0:?}, expected one of: unblock, stop_receiving, proceed")]
pub struct UnknownActionToken(pub String);

/// One outbound command for the instrument, addressed by read identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub channel: Channel,
    pub read_number: ReadNumber,
    pub action: Action,
    /// Seconds the ejection voltage is applied. Only meaningful for
    /// [`Action::Unblock`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unblock_duration: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aln(strand: Strand, r_st: u64, r_en: u64) -> Alignment {
        Alignment {
            contig: "chr20".to_string(),
            strand,
            r_st,
            r_en,
            mapq: 60,
        }
    }

    #[test]
    fn decision_coord_forward_uses_alignment_end() {
        assert_eq!(aln(Strand::Forward, 100, 900).decision_coord(), 900);
    }

    #[test]
    fn decision_coord_reverse_uses_alignment_start() {
        assert_eq!(aln(Strand::Reverse, 100, 900).decision_coord(), 100);
    }

    #[test]
    fn action_tokens_round_trip() {
        for token in Action::TOKENS {
            let action: Action = token.parse().unwrap();
            assert_eq!(action.as_str(), *token);
        }
        assert!("eject".parse::<Action>().is_err());
    }

    #[test]
    fn strand_symbols() {
        assert_eq!(Strand::from_symbol("+"), Some(Strand::Forward));
        assert_eq!(Strand::from_symbol("-"), Some(Strand::Reverse));
        assert_eq!(Strand::from_symbol("."), None);
        assert_eq!(Strand::Forward.as_signed(), 1);
        assert_eq!(Strand::Reverse.as_signed(), -1);
    }

    #[test]
    fn degenerate_alignment_detection() {
        let mut a = aln(Strand::Forward, 10, 20);
        assert!(!a.is_degenerate());
        a.contig.clear();
        assert!(a.is_degenerate());
        let b = aln(Strand::Forward, 20, 10);
        assert!(b.is_degenerate());
    }
}
