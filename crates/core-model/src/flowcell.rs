//! Flow-cell geometry and the channel→region split.
//!
//! The instrument reports channels as flat 1-based numbers; policy regions
//! are rectangular blocks of the physical grid. The grid shape is inferred
//! from the channel count for known flow-cell sizes, and the physical
//! channel→(row, col) permutation can be overridden with vendor data
//! obtained out-of-band. Given the same inputs the resulting map is always
//! the same: no state, no randomness.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Channel;

/// Which grid dimension the regions split.
///
/// The configuration encodes this as an integer: `0` splits rows
/// (horizontal bands), `1` splits columns (vertical bands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitAxis {
    Rows,
    Cols,
}

impl Default for SplitAxis {
    fn default() -> Self {
        SplitAxis::Cols
    }
}

impl TryFrom<u8> for SplitAxis {
    type Error = LayoutError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SplitAxis::Rows),
            1 => Ok(SplitAxis::Cols),
            other => Err(LayoutError::BadSplitAxis(other)),
        }
    }
}

impl SplitAxis {
    pub fn as_u8(&self) -> u8 {
        match self {
            SplitAxis::Rows => 0,
            SplitAxis::Cols => 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("split_axis must be 0 (rows) or 1 (cols), got {0}")]
    BadSplitAxis(u8),
    #[error("flow-cell dimensions must be non-zero, got {rows}x{cols}")]
    EmptyLayout { rows: u16, cols: u16 },
    #[error("channel count {0} does not fit a flow-cell grid")]
    ChannelCountTooLarge(u32),
    #[error(
        "{regions} region(s) do not evenly divide the {dimension} {axis} of the flow cell"
    )]
    IndivisibleAxis {
        axis: &'static str,
        dimension: u16,
        regions: usize,
    },
    #[error("permutation table has {got} entries, expected {expected}")]
    PermutationLength { got: usize, expected: usize },
    #[error("permutation entry {index} points outside the grid: ({row}, {col})")]
    PermutationOutOfRange { index: usize, row: u16, col: u16 },
}

/// Physical shape of the flow cell plus the channel→position permutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowcellLayout {
    rows: u16,
    cols: u16,
    /// Vendor-supplied channel→(row, col) table, indexed by `channel - 1`.
    /// `None` means column-major order: channel 1 at (0, 0), channel 2 at
    /// (1, 0), and so on down each column.
    permutation: Option<Vec<(u16, u16)>>,
}

impl FlowcellLayout {
    pub fn with_dimensions(rows: u16, cols: u16) -> Result<Self, LayoutError> {
        if rows == 0 || cols == 0 {
            return Err(LayoutError::EmptyLayout { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            permutation: None,
        })
    }

    /// Infer the grid from a total channel count. Known instrument sizes map
    /// to their physical grids; any other count becomes a single row, which
    /// keeps the region split well-defined for synthetic runs.
    pub fn from_channel_count(channels: u32) -> Result<Self, LayoutError> {
        let (rows, cols) = match channels {
            126 => (9, 14),
            512 => (16, 32),
            3000 => (25, 120),
            other => {
                let cols = u16::try_from(other)
                    .map_err(|_| LayoutError::ChannelCountTooLarge(other))?;
                (1, cols)
            }
        };
        Self::with_dimensions(rows, cols)
    }

    /// Attach a vendor permutation table (entry `i` is the grid position of
    /// channel `i + 1`).
    pub fn with_permutation(mut self, permutation: Vec<(u16, u16)>) -> Result<Self, LayoutError> {
        let expected = self.channel_count() as usize;
        if permutation.len() != expected {
            return Err(LayoutError::PermutationLength {
                got: permutation.len(),
                expected,
            });
        }
        for (index, &(row, col)) in permutation.iter().enumerate() {
            if row >= self.rows || col >= self.cols {
                return Err(LayoutError::PermutationOutOfRange { index, row, col });
            }
        }
        self.permutation = Some(permutation);
        Ok(self)
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn channel_count(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.cols)
    }

    /// Grid position of a 1-based channel, or `None` when out of range.
    pub fn position_of(&self, channel: Channel) -> Option<(u16, u16)> {
        if channel == 0 || channel > self.channel_count() {
            return None;
        }
        let index = (channel - 1) as usize;
        match &self.permutation {
            Some(table) => table.get(index).copied(),
            None => {
                let row = (index % self.rows as usize) as u16;
                let col = (index / self.rows as usize) as u16;
                Some((row, col))
            }
        }
    }

    /// Partition the grid into `region_count` contiguous blocks along `axis`
    /// and precompute the region index of every channel.
    pub fn split(
        &self,
        axis: SplitAxis,
        region_count: usize,
    ) -> Result<ChannelRegionMap, LayoutError> {
        let dimension = match axis {
            SplitAxis::Rows => self.rows,
            SplitAxis::Cols => self.cols,
        };
        if region_count == 0 || dimension as usize % region_count != 0 {
            return Err(LayoutError::IndivisibleAxis {
                axis: match axis {
                    SplitAxis::Rows => "rows",
                    SplitAxis::Cols => "cols",
                },
                dimension,
                regions: region_count,
            });
        }
        let group = dimension as usize / region_count;
        let assignments = (1..=self.channel_count())
            .map(|channel| {
                // position_of is total over [1, channel_count]
                let (row, col) = self.position_of(channel).expect("channel in range");
                match axis {
                    SplitAxis::Rows => row as usize / group,
                    SplitAxis::Cols => col as usize / group,
                }
            })
            .collect();
        Ok(ChannelRegionMap {
            region_count,
            assignments,
        })
    }
}

/// Precomputed channel→region assignment. Pure data: lookups never fail for
/// channels the layout knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRegionMap {
    region_count: usize,
    assignments: Vec<usize>,
}

impl ChannelRegionMap {
    pub fn region_of(&self, channel: Channel) -> Option<usize> {
        if channel == 0 {
            return None;
        }
        self.assignments.get((channel - 1) as usize).copied()
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    pub fn channel_count(&self) -> u32 {
        self.assignments.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_channel_counts_have_grids() {
        assert_eq!(
            FlowcellLayout::from_channel_count(512).unwrap().channel_count(),
            512
        );
        assert_eq!(
            FlowcellLayout::from_channel_count(126).unwrap().channel_count(),
            126
        );
        assert_eq!(
            FlowcellLayout::from_channel_count(3000)
                .unwrap()
                .channel_count(),
            3000
        );
    }

    #[test]
    fn unknown_count_is_single_row() {
        let layout = FlowcellLayout::from_channel_count(8).unwrap();
        assert_eq!((layout.rows(), layout.cols()), (1, 8));
    }

    #[test]
    fn split_requires_divisibility() {
        let layout = FlowcellLayout::with_dimensions(16, 32).unwrap();
        assert!(layout.split(SplitAxis::Cols, 3).is_err());
        assert!(layout.split(SplitAxis::Cols, 0).is_err());
        assert!(layout.split(SplitAxis::Cols, 4).is_ok());
    }

    #[test]
    fn cols_split_groups_columns() {
        let layout = FlowcellLayout::with_dimensions(2, 4).unwrap();
        let map = layout.split(SplitAxis::Cols, 2).unwrap();
        // Column-major: channels 1..=4 sit in cols 0..1, channels 5..=8 in cols 2..3.
        for channel in 1..=4 {
            assert_eq!(map.region_of(channel), Some(0));
        }
        for channel in 5..=8 {
            assert_eq!(map.region_of(channel), Some(1));
        }
        assert_eq!(map.region_of(9), None);
        assert_eq!(map.region_of(0), None);
    }

    #[test]
    fn rows_split_groups_rows() {
        let layout = FlowcellLayout::with_dimensions(4, 2).unwrap();
        let map = layout.split(SplitAxis::Rows, 2).unwrap();
        // Column-major down each column: rows 0-1 of each column land in region 0.
        assert_eq!(map.region_of(1), Some(0));
        assert_eq!(map.region_of(2), Some(0));
        assert_eq!(map.region_of(3), Some(1));
        assert_eq!(map.region_of(4), Some(1));
        assert_eq!(map.region_of(5), Some(0));
        assert_eq!(map.region_of(7), Some(1));
    }

    #[test]
    fn permutation_overrides_default_order() {
        let layout = FlowcellLayout::with_dimensions(1, 4)
            .unwrap()
            .with_permutation(vec![(0, 3), (0, 2), (0, 1), (0, 0)])
            .unwrap();
        let map = layout.split(SplitAxis::Cols, 2).unwrap();
        assert_eq!(map.region_of(1), Some(1));
        assert_eq!(map.region_of(4), Some(0));
    }

    #[test]
    fn permutation_is_validated() {
        let layout = FlowcellLayout::with_dimensions(1, 2).unwrap();
        assert!(matches!(
            layout.clone().with_permutation(vec![(0, 0)]),
            Err(LayoutError::PermutationLength { .. })
        ));
        assert!(matches!(
            layout.with_permutation(vec![(0, 0), (1, 0)]),
            Err(LayoutError::PermutationOutOfRange { .. })
        ));
    }

    proptest! {
        // Every channel lands in exactly one region and regions are balanced.
        #[test]
        fn split_partitions_channels(rows in 1u16..32, group in 1u16..8, regions in 1usize..6) {
            let cols = group as usize * regions;
            prop_assume!(cols <= u16::MAX as usize);
            let layout = FlowcellLayout::with_dimensions(rows, cols as u16).unwrap();
            let map = layout.split(SplitAxis::Cols, regions).unwrap();
            let mut counts = vec![0u32; regions];
            for channel in 1..=layout.channel_count() {
                let region = map.region_of(channel).unwrap();
                prop_assert!(region < regions);
                counts[region] += 1;
            }
            let per_region = layout.channel_count() / regions as u32;
            prop_assert!(counts.iter().all(|&c| c == per_region));
        }

        // Rebuilding the map from the same inputs yields the same assignment.
        #[test]
        fn split_is_deterministic(rows in 1u16..16, group in 1u16..6, regions in 1usize..5) {
            let cols = (group as usize * regions) as u16;
            let layout = FlowcellLayout::with_dimensions(rows, cols).unwrap();
            let a = layout.split(SplitAxis::Cols, regions).unwrap();
            let b = layout.split(SplitAxis::Cols, regions).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
