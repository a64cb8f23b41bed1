//! Block-cyclic distribution arithmetic.
//!
//! Each dimension is cut into blocks of a fixed size and the blocks are dealt
//! round-robin to the processes along that dimension, starting at a
//! first-owner coordinate. The two dimensions are distributed independently,
//! so everything here is written per axis and combined by [`Distribution`].
//!
//! Ownership is always a pure function of block index. Nothing in this module
//! keeps state between blocks, which is what allows every process to replay
//! the same [`BlockSchedule`] independently.

use crate::grid::{GridCoord, ProcessGrid};
use crate::{BlacsError, Result};

/// Row and column block sizes, constant for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub row_block: usize,
    pub col_block: usize,
}

impl BlockDescriptor {
    pub fn new(row_block: usize, col_block: usize) -> Result<Self> {
        if row_block == 0 || col_block == 0 {
            return Err(BlacsError::InvalidGrid(format!(
                "block sizes must be positive, got {}x{}",
                row_block, col_block
            )));
        }
        Ok(Self { row_block, col_block })
    }
}

/// Number of elements of a dimension of extent `n` owned by coordinate `c`,
/// when blocks of `bs` are dealt to `p` coordinates starting at `c0`.
///
/// Works for any `n`, including `n < bs` and more coordinates than blocks.
/// `bs` and `p` must be positive.
pub fn local_extent(n: usize, bs: usize, c: usize, c0: usize, p: usize) -> usize {
    let full_blocks = n / bs;
    let remainder = n % bs;
    let distance = (c + p - c0 % p) % p;

    let mut blocks = full_blocks / p;
    if full_blocks % p > distance {
        blocks += 1;
    }
    let mut extent = blocks * bs;
    if (c0 + full_blocks) % p == c % p {
        extent += remainder;
    }
    extent
}

/// One dimension of a block-cyclic layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Axis {
    pub extent: usize,
    pub block: usize,
    pub procs: usize,
    pub first_owner: usize,
}

impl Axis {
    pub fn new(extent: usize, block: usize, procs: usize, first_owner: usize) -> Result<Self> {
        if block == 0 || procs == 0 {
            return Err(BlacsError::InvalidGrid(format!(
                "axis needs a positive block size and process count, got {} and {}",
                block, procs
            )));
        }
        if first_owner >= procs {
            return Err(BlacsError::InvalidGrid(format!(
                "first owner {} is outside {} processes",
                first_owner, procs
            )));
        }
        Ok(Self {
            extent,
            block,
            procs,
            first_owner,
        })
    }

    /// Number of (possibly partial) blocks along this axis.
    pub fn num_blocks(&self) -> usize {
        (self.extent + self.block - 1) / self.block
    }

    pub fn owner_of_block(&self, k: usize) -> usize {
        (self.first_owner + k) % self.procs
    }

    /// Index of block `k` among the blocks its owner holds.
    pub fn local_block_index(&self, k: usize) -> usize {
        k / self.procs
    }

    pub fn local_extent(&self, coord: usize) -> usize {
        local_extent(self.extent, self.block, coord, self.first_owner, self.procs)
    }

    /// Owner of global index `i`.
    pub fn owner_of(&self, i: usize) -> usize {
        self.owner_of_block(i / self.block)
    }

    /// Owner and local index of global index `i`.
    pub fn global_to_local(&self, i: usize) -> Option<(usize, usize)> {
        if i >= self.extent {
            return None;
        }
        let k = i / self.block;
        let local = self.local_block_index(k) * self.block + i % self.block;
        Some((self.owner_of_block(k), local))
    }

    /// Global index of local index `l` held by coordinate `coord`.
    pub fn local_to_global(&self, l: usize, coord: usize) -> Option<usize> {
        if coord >= self.procs || l >= self.local_extent(coord) {
            return None;
        }
        let distance = (coord + self.procs - self.first_owner) % self.procs;
        let k = (l / self.block) * self.procs + distance;
        Some(k * self.block + l % self.block)
    }
}

/// The two-dimensional layout of an `m x n` matrix over a process grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distribution {
    pub rows: Axis,
    pub cols: Axis,
}

impl Distribution {
    /// Layout whose first block goes to `first_owner`.
    pub fn new(dims: (usize, usize), block: BlockDescriptor, grid: &ProcessGrid, first_owner: GridCoord) -> Result<Self> {
        if !grid.contains(first_owner) {
            return Err(BlacsError::InvalidCoordinate {
                row: first_owner.row,
                col: first_owner.col,
            });
        }
        Ok(Self {
            rows: Axis::new(dims.0, block.row_block, grid.rows(), first_owner.row)?,
            cols: Axis::new(dims.1, block.col_block, grid.cols(), first_owner.col)?,
        })
    }

    pub fn global_shape(&self) -> (usize, usize) {
        (self.rows.extent, self.cols.extent)
    }

    pub fn local_shape(&self, coord: GridCoord) -> (usize, usize) {
        (self.rows.local_extent(coord.row), self.cols.local_extent(coord.col))
    }

    /// Owner and local position of global element `(i, j)`.
    pub fn locate(&self, i: usize, j: usize) -> Option<(GridCoord, (usize, usize))> {
        let (prow, li) = self.rows.global_to_local(i)?;
        let (pcol, lj) = self.cols.global_to_local(j)?;
        Some((GridCoord::new(prow, pcol), (li, lj)))
    }

    /// Global position of local element `(li, lj)` on `coord`.
    pub fn global_index(&self, coord: GridCoord, li: usize, lj: usize) -> Option<(usize, usize)> {
        Some((
            self.rows.local_to_global(li, coord.row)?,
            self.cols.local_to_global(lj, coord.col)?,
        ))
    }

    pub fn schedule(&self) -> BlockSchedule {
        BlockSchedule::new(*self)
    }
}

/// One block of the global matrix and where it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAssignment {
    pub global_row: usize,
    pub global_col: usize,
    pub rows: usize,
    pub cols: usize,
    pub owner: GridCoord,
    pub local_row: usize,
    pub local_col: usize,
}

/// Every block of a [`Distribution`], column blocks outer and row blocks
/// inner. All processes iterate it in the same order, which is what pairs
/// the coordinator's sends with the owners' receives.
#[derive(Debug, Clone)]
pub struct BlockSchedule {
    dist: Distribution,
    row_block: usize,
    col_block: usize,
}

impl BlockSchedule {
    pub fn new(dist: Distribution) -> Self {
        Self {
            dist,
            row_block: 0,
            col_block: 0,
        }
    }

    fn assignment(&self, kr: usize, kc: usize) -> BlockAssignment {
        let rows = &self.dist.rows;
        let cols = &self.dist.cols;
        let global_row = kr * rows.block;
        let global_col = kc * cols.block;
        BlockAssignment {
            global_row,
            global_col,
            rows: rows.block.min(rows.extent - global_row),
            cols: cols.block.min(cols.extent - global_col),
            owner: GridCoord::new(rows.owner_of_block(kr), cols.owner_of_block(kc)),
            local_row: rows.local_block_index(kr) * rows.block,
            local_col: cols.local_block_index(kc) * cols.block,
        }
    }
}

impl Iterator for BlockSchedule {
    type Item = BlockAssignment;

    fn next(&mut self) -> Option<BlockAssignment> {
        let row_blocks = self.dist.rows.num_blocks();
        let col_blocks = self.dist.cols.num_blocks();
        if row_blocks == 0 || self.col_block >= col_blocks {
            return None;
        }
        let block = self.assignment(self.row_block, self.col_block);
        self.row_block += 1;
        if self.row_block == row_blocks {
            self.row_block = 0;
            self.col_block += 1;
        }
        Some(block)
    }
}
