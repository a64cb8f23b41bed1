//! Two-dimensional process grid.
//!
//! A [`ProcessGrid`] is a pure description of the grid shape and of how
//! linear ranks map onto coordinates. Every process builds the same grid, so
//! the mapping is known identically everywhere without communication.

use std::fmt;

use crate::{BlacsError, Result};

/// A process's `(row, col)` position in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GridCoord {
    pub row: usize,
    pub col: usize,
}

impl GridCoord {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// How consecutive ranks are laid onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankOrder {
    /// Rank `r` sits at `(r / cols, r % cols)`.
    RowMajor,
    /// Rank `r` sits at `(r % rows, r / rows)`.
    #[default]
    ColumnMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGrid {
    rows: usize,
    cols: usize,
    order: RankOrder,
}

impl ProcessGrid {
    pub fn new(rows: usize, cols: usize, order: RankOrder) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(BlacsError::InvalidGrid(format!(
                "grid extents must be positive, got {}x{}",
                rows, cols
            )));
        }
        Ok(Self { rows, cols, order })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn order(&self) -> RankOrder {
        self.order
    }

    /// Number of processes in the grid.
    pub fn size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn contains(&self, coord: GridCoord) -> bool {
        coord.row < self.rows && coord.col < self.cols
    }

    pub fn coordinate_of(&self, rank: usize) -> Result<GridCoord> {
        if rank >= self.size() {
            return Err(BlacsError::InvalidRank(rank));
        }
        Ok(match self.order {
            RankOrder::RowMajor => GridCoord::new(rank / self.cols, rank % self.cols),
            RankOrder::ColumnMajor => GridCoord::new(rank % self.rows, rank / self.rows),
        })
    }

    pub fn rank_of(&self, coord: GridCoord) -> Result<usize> {
        if !self.contains(coord) {
            return Err(BlacsError::InvalidCoordinate {
                row: coord.row,
                col: coord.col,
            });
        }
        Ok(match self.order {
            RankOrder::RowMajor => coord.row * self.cols + coord.col,
            RankOrder::ColumnMajor => coord.col * self.rows + coord.row,
        })
    }

    /// All coordinates, in rank order.
    pub fn coordinates(&self) -> impl Iterator<Item = GridCoord> + '_ {
        (0..self.size()).filter_map(move |rank| self.coordinate_of(rank).ok())
    }
}
