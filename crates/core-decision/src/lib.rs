//! Decision engine: pure classification of one read against one condition.
//!
//! The engine never fails: every read gets a [`Decision`] and an
//! [`Action`], with degenerate aligner output downgraded to `no_map` under
//! a warning. Terminal-state suppression and chunk accounting live in the
//! [`tracker`], which the driver consults before and after classification.

use tracing::warn;

use core_config::Condition;
use core_model::{Action, BasecalledRead, Decision};

pub mod tracker;

pub use tracker::{ActionTracker, Terminal, TrackerSnapshot};

/// What the engine concluded for one read: the classification itself and
/// the action the condition's policy table maps it to (already collapsed to
/// `proceed` for control conditions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub action: Action,
}

/// Classify `read` under `condition`, given the cumulative chunk count for
/// its (channel, read number).
///
/// Order matters and is part of the contract:
/// 1. fewer chunks than `min_chunks` → `below_min_chunks`;
/// 2. more chunks than `max_chunks` → `above_max_chunks`, superseding any
///    on/off-target classification;
/// 3. otherwise classify by sequence and alignments, checking each
///    alignment's 3′-end coordinate against the condition's targets.
pub fn decide(read: &BasecalledRead, condition: &Condition, chunk_count: u32) -> DecisionOutcome {
    let decision = if chunk_count < condition.min_chunks {
        Decision::BelowMinChunks
    } else if chunk_count > condition.max_chunks {
        Decision::AboveMaxChunks
    } else {
        classify(read, condition)
    };
    let action = if condition.control {
        Action::Proceed
    } else {
        condition.actions.action_for(decision)
    };
    DecisionOutcome { decision, action }
}

fn classify(read: &BasecalledRead, condition: &Condition) -> Decision {
    if read.sequence.is_empty() {
        return Decision::NoSeq;
    }
    if read.alignments.is_empty() {
        return Decision::NoMap;
    }
    if read.alignments.iter().any(|a| a.is_degenerate()) {
        // Nonsensical aligner output; treat the whole read as unmapped
        // rather than trusting the remaining records.
        warn!(
            target: "decision",
            read_id = %read.read_id,
            channel = read.channel,
            "degenerate alignment record, reclassifying as no_map"
        );
        return Decision::NoMap;
    }
    let hits = read
        .alignments
        .iter()
        .filter(|a| {
            condition
                .targets
                .check_coord(&a.contig, a.strand, a.decision_coord())
        })
        .count();
    match (read.alignments.len(), hits) {
        (1, 0) => Decision::SingleOff,
        (1, _) => Decision::SingleOn,
        (_, 0) => Decision::MultiOff,
        (_, _) => Decision::MultiOn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::ActionTable;
    use core_model::{Alignment, Strand};
    use core_targets::TargetIndex;

    fn actions() -> ActionTable {
        ActionTable {
            single_on: Action::StopReceiving,
            multi_on: Action::StopReceiving,
            single_off: Action::Unblock,
            multi_off: Action::Unblock,
            no_seq: Action::Proceed,
            no_map: Action::Proceed,
            above_max_chunks: Action::Unblock,
            below_min_chunks: Action::Proceed,
        }
    }

    fn condition(control: bool, min_chunks: u32, max_chunks: u32) -> Condition {
        Condition {
            name: "test".to_string(),
            control,
            min_chunks,
            max_chunks,
            targets: TargetIndex::from_inline(&["chr20,0,10000,+", "chr20,0,10000,-"]).unwrap(),
            actions: actions(),
        }
    }

    fn read(sequence: &str, alignments: Vec<Alignment>) -> BasecalledRead {
        BasecalledRead {
            read_id: "read-1".to_string(),
            channel: 100,
            read_number: 1,
            barcode: None,
            sequence: sequence.to_string(),
            mean_qscore: 10.0,
            error: None,
            alignments,
            decision: None,
        }
    }

    fn aln(contig: &str, strand: Strand, r_st: u64, r_en: u64) -> Alignment {
        Alignment {
            contig: contig.to_string(),
            strand,
            r_st,
            r_en,
            mapq: 60,
        }
    }

    #[test]
    fn single_hit_on_target() {
        let outcome = decide(
            &read("ACGT", vec![aln("chr20", Strand::Forward, 0, 500)]),
            &condition(false, 0, 16),
            1,
        );
        assert_eq!(outcome.decision, Decision::SingleOn);
        assert_eq!(outcome.action, Action::StopReceiving);
    }

    #[test]
    fn single_hit_off_target() {
        let outcome = decide(
            &read("ACGT", vec![aln("chrX", Strand::Forward, 0, 500)]),
            &condition(false, 0, 16),
            1,
        );
        assert_eq!(outcome.decision, Decision::SingleOff);
        assert_eq!(outcome.action, Action::Unblock);
    }

    // The query coordinate is the 3′ end on the sequencing strand: r_en
    // forward, r_st reverse.
    #[test]
    fn coordinate_semantics_by_strand() {
        let condition = condition(false, 0, 16);
        // Forward alignment whose start is inside the target but whose end
        // has left it: off-target.
        let outcome = decide(
            &read("ACGT", vec![aln("chr20", Strand::Forward, 9_000, 20_000)]),
            &condition,
            1,
        );
        assert_eq!(outcome.decision, Decision::SingleOff);
        // Reverse alignment with the same span: r_st is checked, on-target.
        let outcome = decide(
            &read("ACGT", vec![aln("chr20", Strand::Reverse, 9_000, 20_000)]),
            &condition,
            1,
        );
        assert_eq!(outcome.decision, Decision::SingleOn);
    }

    #[test]
    fn multi_mapping_classification() {
        let condition = condition(false, 0, 16);
        let on = decide(
            &read(
                "ACGT",
                vec![
                    aln("chrX", Strand::Forward, 0, 500),
                    aln("chr20", Strand::Forward, 0, 500),
                ],
            ),
            &condition,
            1,
        );
        assert_eq!(on.decision, Decision::MultiOn);
        let off = decide(
            &read(
                "ACGT",
                vec![
                    aln("chrX", Strand::Forward, 0, 500),
                    aln("chrY", Strand::Forward, 0, 500),
                ],
            ),
            &condition,
            1,
        );
        assert_eq!(off.decision, Decision::MultiOff);
    }

    #[test]
    fn empty_sequence_and_no_mapping() {
        let condition = condition(false, 0, 16);
        assert_eq!(
            decide(&read("", vec![]), &condition, 1).decision,
            Decision::NoSeq
        );
        assert_eq!(
            decide(&read("ACGT", vec![]), &condition, 1).decision,
            Decision::NoMap
        );
    }

    #[test]
    fn degenerate_alignment_reclassifies_as_no_map() {
        let outcome = decide(
            &read("ACGT", vec![aln("", Strand::Forward, 0, 500)]),
            &condition(false, 0, 16),
            1,
        );
        assert_eq!(outcome.decision, Decision::NoMap);
        assert_eq!(outcome.action, Action::Proceed);
    }

    // min_chunks = 0 means the below-minimum branch can never fire.
    #[test]
    fn zero_min_chunks_never_defers() {
        let outcome = decide(&read("ACGT", vec![]), &condition(false, 0, 16), 0);
        assert_ne!(outcome.decision, Decision::BelowMinChunks);
    }

    #[test]
    fn below_min_chunks_defers() {
        let outcome = decide(
            &read("ACGT", vec![aln("chr20", Strand::Forward, 0, 500)]),
            &condition(false, 2, 16),
            1,
        );
        assert_eq!(outcome.decision, Decision::BelowMinChunks);
        assert_eq!(outcome.action, Action::Proceed);
    }

    // The above-maximum branch supersedes an on-target classification.
    #[test]
    fn above_max_chunks_supersedes_classification() {
        let outcome = decide(
            &read(
                "ACGT",
                vec![
                    aln("chr20", Strand::Forward, 0, 500),
                    aln("chr20", Strand::Reverse, 600, 900),
                ],
            ),
            &condition(false, 0, 2),
            3,
        );
        assert_eq!(outcome.decision, Decision::AboveMaxChunks);
        assert_eq!(outcome.action, Action::Unblock);
    }

    // Control conditions classify for statistics but always proceed.
    #[test]
    fn control_collapses_action_to_proceed() {
        let outcome = decide(
            &read("ACGT", vec![aln("chrX", Strand::Forward, 0, 500)]),
            &condition(true, 0, 16),
            1,
        );
        assert_eq!(outcome.decision, Decision::SingleOff);
        assert_eq!(outcome.action, Action::Proceed);
    }

    #[test]
    fn max_chunks_boundary_is_exclusive() {
        // Exactly max_chunks still classifies; one past it gates.
        let condition = condition(false, 0, 2);
        let at_max = decide(
            &read("ACGT", vec![aln("chr20", Strand::Forward, 0, 500)]),
            &condition,
            2,
        );
        assert_eq!(at_max.decision, Decision::SingleOn);
        let past_max = decide(
            &read("ACGT", vec![aln("chr20", Strand::Forward, 0, 500)]),
            &condition,
            3,
        );
        assert_eq!(past_max.decision, Decision::AboveMaxChunks);
    }
}
