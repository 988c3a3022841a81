//! Write positions along the sequence axis.
//!
//! A decode step writes one position, a prefill writes a contiguous run, and
//! a scatter-capable backend can take any set of distinct indices in one call.

use std::collections::HashSet;
use std::ops::Range;

use crate::error::{Error, Result};

/// Sequence positions targeted by a single cache update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePositions {
    /// One decode step.
    Step(usize),
    /// Contiguous run `[start, start + len)`, typically a prefill.
    Run { start: usize, len: usize },
    /// Arbitrary ordered index set.
    Indices(Vec<usize>),
}

impl WritePositions {
    /// Number of positions written.
    pub fn len(&self) -> usize {
        match self {
            Self::Step(_) => 1,
            Self::Run { len, .. } => *len,
            Self::Indices(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions in write order.
    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            Self::Step(pos) => vec![*pos],
            Self::Run { start, len } => (*start..start + len).collect(),
            Self::Indices(indices) => indices.clone(),
        }
    }

    /// Start of the run if the positions are one ascending contiguous run.
    pub fn contiguous_start(&self) -> Option<usize> {
        match self {
            Self::Step(pos) => Some(*pos),
            Self::Run { start, len } if *len > 0 => Some(*start),
            Self::Run { .. } => None,
            Self::Indices(indices) => {
                let first = *indices.first()?;
                let contiguous = indices
                    .iter()
                    .enumerate()
                    .all(|(i, &pos)| pos.checked_sub(first) == Some(i));
                contiguous.then_some(first)
            }
        }
    }

    /// One past the highest position written.
    pub fn end(&self) -> usize {
        match self {
            Self::Step(pos) => pos + 1,
            Self::Run { start, len } => start + len,
            Self::Indices(indices) => indices.iter().max().map_or(0, |&max| max + 1),
        }
    }

    /// Checks the positions are non-empty, distinct and inside `[0, max_seq_len)`.
    pub fn validate(&self, max_seq_len: usize) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidPositions("no positions to write".into()));
        }

        match self {
            Self::Step(pos) => check_bound(*pos, max_seq_len),
            Self::Run { start, len } => {
                // Report the first position that falls off the end.
                let last = start.saturating_add(len - 1);
                if last >= max_seq_len {
                    let position = (*start).max(max_seq_len);
                    return Err(Error::PositionOutOfBounds {
                        position,
                        max_seq_len,
                    });
                }
                Ok(())
            }
            Self::Indices(indices) => {
                let mut seen = HashSet::with_capacity(indices.len());
                for &pos in indices {
                    check_bound(pos, max_seq_len)?;
                    if !seen.insert(pos) {
                        return Err(Error::InvalidPositions(format!(
                            "position {pos} appears more than once"
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_bound(position: usize, max_seq_len: usize) -> Result<()> {
    if position >= max_seq_len {
        return Err(Error::PositionOutOfBounds {
            position,
            max_seq_len,
        });
    }
    Ok(())
}

impl From<usize> for WritePositions {
    fn from(pos: usize) -> Self {
        Self::Step(pos)
    }
}

impl From<Range<usize>> for WritePositions {
    fn from(range: Range<usize>) -> Self {
        Self::Run {
            start: range.start,
            len: range.end.saturating_sub(range.start),
        }
    }
}

impl From<Vec<usize>> for WritePositions {
    fn from(indices: Vec<usize>) -> Self {
        Self::Indices(indices)
    }
}

impl From<&[usize]> for WritePositions {
    fn from(indices: &[usize]) -> Self {
        Self::Indices(indices.to_vec())
    }
}
