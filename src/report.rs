//! Rank-ordered console output.

use std::io::{self, Write};

use crate::comm::Topology;
use crate::grid::GridCoord;
use crate::scatter::LocalMatrix;
use crate::Result;

/// Run `print` on each rank in turn, with a barrier after every turn so the
/// output appears in rank order.
pub fn in_rank_order<C, F>(comm: &C, mut print: F) -> Result<()>
where
    C: Topology,
    F: FnMut() -> Result<()>,
{
    for rank in 0..comm.grid().size() {
        if rank == comm.rank() {
            print()?;
            io::stdout().flush()?;
        }
        comm.barrier()?;
    }
    Ok(())
}

pub fn format_coordinate(rank: usize, coord: GridCoord) -> String {
    format!("Proc {}: {}, {}", rank, coord.row, coord.col)
}

/// Header line plus the local matrix, one matrix row per line.
pub fn format_local(rank: usize, local: &LocalMatrix) -> String {
    let matrix = local.matrix();
    let mut out = format!(
        "Proc {} {}: local {}x{}\n",
        rank,
        local.coordinate(),
        matrix.rows(),
        matrix.cols()
    );
    if matrix.is_empty() {
        out.push_str("  (empty)\n");
    } else {
        out.push_str(&matrix.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{BlockDescriptor, Distribution};
    use crate::grid::{ProcessGrid, RankOrder};

    #[test]
    fn test_format_coordinate() {
        assert_eq!(format_coordinate(3, GridCoord::new(1, 1)), "Proc 3: 1, 1");
    }

    #[test]
    fn test_format_empty_share() {
        let grid = ProcessGrid::new(2, 2, RankOrder::ColumnMajor).unwrap();
        let block = BlockDescriptor::new(4, 4).unwrap();
        let dist = Distribution::new((2, 2), block, &grid, GridCoord::default()).unwrap();
        let local = LocalMatrix::new(dist, GridCoord::new(1, 1));
        let text = format_local(3, &local);
        assert!(text.starts_with("Proc 3 (1, 1): local 0x0"));
        assert!(text.contains("(empty)"));
    }

    #[test]
    fn test_format_filled_share() {
        let grid = ProcessGrid::new(1, 1, RankOrder::ColumnMajor).unwrap();
        let block = BlockDescriptor::new(2, 2).unwrap();
        let dist = Distribution::new((1, 2), block, &grid, GridCoord::default()).unwrap();
        let local = LocalMatrix::new(dist, GridCoord::default());
        let text = format_local(0, &local);
        assert_eq!(text.lines().count(), 2);
    }
}
