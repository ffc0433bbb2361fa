//! Common types and constants shared between the loader and the monitor

use std::{collections::BTreeSet, time::Duration};
use thiserror::Error;

/// Number of SNAP2 boards running the F-engine
pub const BOARDS: usize = 11;
/// Number of ADC inputs (streams) on each board
pub const STREAMS_PER_BOARD: usize = 64;
/// Number of digital signals across the whole array
pub const SIGNALS: usize = BOARDS * STREAMS_PER_BOARD;
/// Number of frequency channels in an autocorrelation spectrum (set by gateware)
pub const CHANNELS: usize = 4096;
/// ADC sampling clock in Hz
pub const ADC_CLOCK: f64 = 196_000_000.0;
/// Minimum delay applied to any input, in ADC clocks
pub const DELAY_OFFSET: i64 = 10;
/// FFT shift schedule used when the settings file doesn't name one
pub const DEFAULT_FFT_SHIFT: u32 = 0x1FFC;
/// How long configuration calls wait for their board to respond
pub const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a digital signal lives on the F-engine array
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FengInput {
    /// Board number, 1-based
    pub board: usize,
    /// Input number on that board
    pub stream: usize,
}

/// Map a digital signal number to the board and stream that digitize it.
///
/// This is total over `usize`; numbers past the end of the array simply map to
/// boards that don't exist, which are never in an [`ActiveBoards`].
#[must_use]
pub const fn dsig_to_feng(dsig: usize) -> FengInput {
    FengInput {
        board: dsig / STREAMS_PER_BOARD + 1,
        stream: dsig % STREAMS_PER_BOARD,
    }
}

/// Like [`dsig_to_feng`], but only for signals that exist
#[must_use]
pub const fn try_dsig_to_feng(dsig: usize) -> Option<FengInput> {
    if dsig < SIGNALS {
        Some(dsig_to_feng(dsig))
    } else {
        None
    }
}

impl FengInput {
    /// The digital signal this input digitizes
    #[must_use]
    pub const fn dsig(self) -> usize {
        (self.board - 1) * STREAMS_PER_BOARD + self.stream
    }
}

/// Digital signals that already received a setting of some category
pub type AssignedSet = BTreeSet<usize>;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Board {0} doesn't exist, boards are numbered 1 through 11")]
pub struct NoSuchBoard(pub usize);

/// The boards a run actually touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBoards(BTreeSet<usize>);

impl ActiveBoards {
    /// Every board in the array
    #[must_use]
    pub fn all() -> Self {
        Self((1..=BOARDS).collect())
    }

    /// A subset of boards, rejecting numbers outside `1..=BOARDS`
    pub fn new(boards: impl IntoIterator<Item = usize>) -> Result<Self, NoSuchBoard> {
        let set = boards
            .into_iter()
            .map(|b| {
                if (1..=BOARDS).contains(&b) {
                    Ok(b)
                } else {
                    Err(NoSuchBoard(b))
                }
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self(set))
    }

    #[must_use]
    pub fn contains(&self, board: usize) -> bool {
        self.0.contains(&board)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ActiveBoards {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_examples() {
        assert_eq!(dsig_to_feng(0), FengInput { board: 1, stream: 0 });
        assert_eq!(dsig_to_feng(75), FengInput { board: 2, stream: 11 });
        assert_eq!(dsig_to_feng(703), FengInput { board: 11, stream: 63 });
    }

    #[test]
    fn test_mapping_is_bijective() {
        let locations: BTreeSet<_> = (0..SIGNALS).map(dsig_to_feng).collect();
        assert_eq!(locations.len(), SIGNALS);
        for loc in &locations {
            assert!((1..=BOARDS).contains(&loc.board));
            assert!(loc.stream < STREAMS_PER_BOARD);
        }
        for i in 0..SIGNALS {
            assert_eq!(dsig_to_feng(i).dsig(), i);
        }
    }

    #[test]
    fn test_checked_mapping() {
        assert_eq!(try_dsig_to_feng(703), Some(FengInput { board: 11, stream: 63 }));
        assert_eq!(try_dsig_to_feng(SIGNALS), None);
    }

    #[test]
    fn test_active_boards() {
        let active = ActiveBoards::new([3, 1, 2, 2]).unwrap();
        assert_eq!(active.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!active.contains(dsig_to_feng(700).board));
        assert_eq!(ActiveBoards::new([0]), Err(NoSuchBoard(0)));
        assert_eq!(ActiveBoards::new([12]), Err(NoSuchBoard(12)));
        assert_eq!(ActiveBoards::all().len(), BOARDS);
    }
}
