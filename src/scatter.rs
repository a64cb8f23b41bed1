//! Block-cyclic scatter and gather.
//!
//! Every process walks the same [`BlockSchedule`]: column blocks outer, row
//! blocks inner. For each block the coordinator sends, and the owner
//! receives into its local matrix. Because ownership and local offsets are
//! computed from the block index alone, a process never depends on what it
//! did for earlier blocks, and the sends and receives pair up as long as all
//! processes iterate the same schedule.
//!
//! The coordinator sends to itself like to any other owner. This relies on
//! the transport buffering sends (see [`Transport`]).

use log::{debug, info};

use crate::comm::{Topology, Transport};
use crate::distribution::{BlockDescriptor, BlockSchedule, Distribution};
use crate::grid::GridCoord;
use crate::matrix::Matrix;
use crate::{BlacsError, Result};

/// The full matrix, which only the coordinator has.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalMatrix {
    Present(Matrix),
    Absent,
}

impl GlobalMatrix {
    pub fn is_present(&self) -> bool {
        matches!(self, GlobalMatrix::Present(_))
    }

    pub fn shape(&self) -> Option<(usize, usize)> {
        match self {
            GlobalMatrix::Present(m) => Some(m.shape()),
            GlobalMatrix::Absent => None,
        }
    }

    pub fn into_matrix(self) -> Option<Matrix> {
        match self {
            GlobalMatrix::Present(m) => Some(m),
            GlobalMatrix::Absent => None,
        }
    }
}

impl From<Option<Matrix>> for GlobalMatrix {
    fn from(matrix: Option<Matrix>) -> Self {
        matrix.map_or(GlobalMatrix::Absent, GlobalMatrix::Present)
    }
}

/// One process's share of a distributed matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMatrix {
    coord: GridCoord,
    distribution: Distribution,
    matrix: Matrix,
}

impl LocalMatrix {
    /// A zero-filled share sized for `coord`.
    pub fn new(distribution: Distribution, coord: GridCoord) -> Self {
        let (rows, cols) = distribution.local_shape(coord);
        Self {
            coord,
            distribution,
            matrix: Matrix::zeros(rows, cols),
        }
    }

    pub fn coordinate(&self) -> GridCoord {
        self.coord
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn into_matrix(self) -> Matrix {
        self.matrix
    }

    /// Global position of local element `(li, lj)`.
    pub fn global_index(&self, li: usize, lj: usize) -> Option<(usize, usize)> {
        self.distribution.global_index(self.coord, li, lj)
    }
}

/// Drives the block-by-block exchange between the coordinator and the owners.
#[derive(Debug, Clone, Copy)]
pub struct ScatterScheduler {
    block: BlockDescriptor,
    root: GridCoord,
    first_owner: GridCoord,
}

impl ScatterScheduler {
    /// Scheduler rooted at `root`; the first block goes to `(0, 0)`.
    pub fn new(block: BlockDescriptor, root: GridCoord) -> Self {
        Self {
            block,
            root,
            first_owner: GridCoord::default(),
        }
    }

    /// Deal the first block to `first_owner` instead of `(0, 0)`.
    pub fn with_first_owner(mut self, first_owner: GridCoord) -> Self {
        self.first_owner = first_owner;
        self
    }

    pub fn root(&self) -> GridCoord {
        self.root
    }

    pub fn block(&self) -> BlockDescriptor {
        self.block
    }

    pub fn distribution<C: Topology>(&self, comm: &C, dims: (usize, usize)) -> Result<Distribution> {
        Distribution::new(dims, self.block, comm.grid(), self.first_owner)
    }

    /// Distribute `global` from the root. Collective: every process in the
    /// grid must call it, the root with [`GlobalMatrix::Present`] and everyone
    /// else with [`GlobalMatrix::Absent`].
    ///
    /// Any transport error is returned as is; a failed scatter leaves the
    /// grid out of step and the run has to be aborted.
    pub fn scatter<C>(&self, comm: &C, global: GlobalMatrix) -> Result<LocalMatrix>
    where
        C: Topology + Transport,
    {
        let me = comm.coordinate();
        let is_root = me == self.root;
        if is_root != global.is_present() {
            return Err(BlacsError::InitError(format!(
                "process {} {} the global matrix, but the coordinator is {}",
                me,
                if global.is_present() { "holds" } else { "lacks" },
                self.root
            )));
        }

        let dims = comm.broadcast(&global.shape().unwrap_or((0, 0)), self.root)?;
        let distribution = self.distribution(comm, dims)?;
        let mut local = LocalMatrix::new(distribution, me);
        info!(
            "Process {} receives a {}x{} share of a {}x{} matrix",
            me,
            local.matrix.rows(),
            local.matrix.cols(),
            dims.0,
            dims.1
        );

        for block in BlockSchedule::new(distribution) {
            if let GlobalMatrix::Present(ref source) = global {
                debug!(
                    "Sending {}x{} block at ({}, {}) to {}",
                    block.rows, block.cols, block.global_row, block.global_col, block.owner
                );
                comm.send(
                    source.tail_from(block.global_row, block.global_col),
                    block.rows,
                    block.cols,
                    source.stride(),
                    block.owner,
                )?;
            }
            if block.owner == me {
                let stride = local.matrix.stride();
                comm.receive(
                    local.matrix.tail_from_mut(block.local_row, block.local_col),
                    block.rows,
                    block.cols,
                    stride,
                    self.root,
                )?;
            }
        }

        Ok(local)
    }

    /// Collect every share back onto the root. Collective, the inverse of
    /// [`ScatterScheduler::scatter`]: returns [`GlobalMatrix::Present`] on the
    /// root and [`GlobalMatrix::Absent`] elsewhere.
    pub fn gather<C>(&self, comm: &C, local: &LocalMatrix) -> Result<GlobalMatrix>
    where
        C: Topology + Transport,
    {
        let me = comm.coordinate();
        if local.coord != me {
            return Err(BlacsError::ShapeMismatch(format!(
                "share of {} cannot be gathered from {}",
                local.coord, me
            )));
        }

        let distribution = local.distribution;
        let mut global = if me == self.root {
            let (rows, cols) = distribution.global_shape();
            Some(Matrix::zeros(rows, cols))
        } else {
            None
        };

        for block in BlockSchedule::new(distribution) {
            if block.owner == me {
                comm.send(
                    local.matrix.tail_from(block.local_row, block.local_col),
                    block.rows,
                    block.cols,
                    local.matrix.stride(),
                    self.root,
                )?;
            }
            if let Some(ref mut target) = global {
                let stride = target.stride();
                comm.receive(
                    target.tail_from_mut(block.global_row, block.global_col),
                    block.rows,
                    block.cols,
                    stride,
                    block.owner,
                )?;
            }
        }

        Ok(global.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{ProcessGrid, RankOrder};
    use crate::threaded::run_on_grid;

    /// `m x n` matrix whose element `(i, j)` is `100 * i + j`.
    fn labelled(m: usize, n: usize) -> Matrix {
        let values: Vec<f64> = (0..m)
            .flat_map(|i| (0..n).map(move |j| (100 * i + j) as f64))
            .collect();
        Matrix::from_row_major(m, n, &values).unwrap()
    }

    fn scatter_on(
        grid: ProcessGrid,
        global: &Matrix,
        block: BlockDescriptor,
        root: GridCoord,
    ) -> Vec<LocalMatrix> {
        let scheduler = ScatterScheduler::new(block, root);
        run_on_grid(grid, |comm| {
            let mine = if comm.coordinate() == root {
                GlobalMatrix::Present(global.clone())
            } else {
                GlobalMatrix::Absent
            };
            scheduler.scatter(comm, mine)
        })
        .unwrap()
    }

    #[test]
    fn test_scatter_4x5_on_2x2() {
        let grid = ProcessGrid::new(2, 2, RankOrder::ColumnMajor).unwrap();
        let block = BlockDescriptor::new(2, 3).unwrap();
        let global = labelled(4, 5);
        let shares = scatter_on(grid, &global, block, GridCoord::default());

        let by_coord = |row, col| {
            shares
                .iter()
                .find(|s| s.coordinate() == GridCoord::new(row, col))
                .unwrap()
        };

        assert_eq!(by_coord(0, 0).matrix().shape(), (2, 3));
        assert_eq!(by_coord(1, 0).matrix().shape(), (2, 3));
        assert_eq!(by_coord(0, 1).matrix().shape(), (2, 2));
        assert_eq!(by_coord(1, 1).matrix().shape(), (2, 2));

        let expected_00 = Matrix::from_row_major(2, 3, &[0.0, 1.0, 2.0, 100.0, 101.0, 102.0]).unwrap();
        assert_eq!(by_coord(0, 0).matrix(), &expected_00);
        let expected_11 = Matrix::from_row_major(2, 2, &[203.0, 204.0, 303.0, 304.0]).unwrap();
        assert_eq!(by_coord(1, 1).matrix(), &expected_11);
    }

    #[test]
    fn test_every_local_element_maps_back() {
        let grid = ProcessGrid::new(2, 3, RankOrder::RowMajor).unwrap();
        let block = BlockDescriptor::new(3, 2).unwrap();
        let global = labelled(10, 9);
        let shares = scatter_on(grid, &global, block, GridCoord::default());

        let mut total = 0;
        for share in &shares {
            let local = share.matrix();
            for li in 0..local.rows() {
                for lj in 0..local.cols() {
                    let (i, j) = share.global_index(li, lj).unwrap();
                    assert_eq!(local[(li, lj)], global[(i, j)]);
                    total += 1;
                }
            }
        }
        assert_eq!(total, 90);
    }

    #[test]
    fn test_matrix_smaller_than_one_block() {
        let grid = ProcessGrid::new(2, 2, RankOrder::ColumnMajor).unwrap();
        let block = BlockDescriptor::new(8, 8).unwrap();
        let global = labelled(3, 5);
        let shares = scatter_on(grid, &global, block, GridCoord::default());
        for share in &shares {
            if share.coordinate() == GridCoord::new(0, 0) {
                assert_eq!(share.matrix(), &global);
            } else {
                assert!(share.matrix().is_empty());
            }
        }
    }

    #[test]
    fn test_non_zero_root_and_first_owner() {
        let grid = ProcessGrid::new(2, 2, RankOrder::RowMajor).unwrap();
        let block = BlockDescriptor::new(2, 2).unwrap();
        let root = GridCoord::new(1, 0);
        let scheduler = ScatterScheduler::new(block, root).with_first_owner(GridCoord::new(1, 1));
        let global = labelled(5, 3);

        let gathered = run_on_grid(grid, |comm| {
            let mine = if comm.coordinate() == root {
                GlobalMatrix::Present(global.clone())
            } else {
                GlobalMatrix::Absent
            };
            let share = scheduler.scatter(comm, mine)?;
            if comm.coordinate() == GridCoord::new(1, 1) {
                // first row block and first column block both land here
                assert_eq!(share.matrix()[(0, 0)], 0.0);
            }
            scheduler.gather(comm, &share)
        })
        .unwrap();

        for (rank, result) in gathered.into_iter().enumerate() {
            if grid.coordinate_of(rank).unwrap() == root {
                assert_eq!(result, GlobalMatrix::Present(global.clone()));
            } else {
                assert_eq!(result, GlobalMatrix::Absent);
            }
        }
    }

    #[test]
    fn test_absent_matrix_on_root_is_rejected() {
        let grid = ProcessGrid::new(1, 1, RankOrder::RowMajor).unwrap();
        let block = BlockDescriptor::new(2, 2).unwrap();
        let scheduler = ScatterScheduler::new(block, GridCoord::default());
        let result = run_on_grid(grid, |comm| scheduler.scatter(comm, GlobalMatrix::Absent));
        assert!(matches!(result, Err(BlacsError::InitError(_))));
    }

    #[test]
    fn test_empty_matrix_scatters_to_empty_shares() {
        let grid = ProcessGrid::new(2, 1, RankOrder::RowMajor).unwrap();
        let block = BlockDescriptor::new(2, 2).unwrap();
        let shares = scatter_on(grid, &Matrix::zeros(0, 4), block, GridCoord::default());
        for share in &shares {
            assert_eq!(share.matrix().rows(), 0);
        }
        assert_eq!(shares[0].matrix().cols(), 4);
        assert_eq!(shares[1].matrix().cols(), 4);
    }
}
