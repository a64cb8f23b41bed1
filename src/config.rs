//! Run configuration and command line handling.
//!
//! The grid shape, rank order and block sizes are fixed at build time; the
//! command line only names the input file.

use std::path::PathBuf;

use crate::distribution::BlockDescriptor;
use crate::grid::{GridCoord, ProcessGrid, RankOrder};
use crate::world::{block_fits_slot, MAX_MSG_SIZE, MAX_PROCS};
use crate::{BlacsError, Result};

pub const USAGE: &str = "usage: simple-blacs <matrix-file>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    pub grid_rows: usize,
    pub grid_cols: usize,
    pub order: RankOrder,
    pub block: BlockDescriptor,
    /// Coordinator holding the input matrix.
    pub root: GridCoord,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            grid_rows: 2,
            grid_cols: 2,
            order: RankOrder::ColumnMajor,
            block: BlockDescriptor {
                row_block: 2,
                col_block: 2,
            },
            root: GridCoord::new(0, 0),
        }
    }
}

impl RunConfig {
    /// Check the configuration and build its grid.
    ///
    /// The coordinator must be rank 0: the input is read by the launching
    /// process before any other process exists.
    pub fn validate(&self) -> Result<ProcessGrid> {
        let grid = ProcessGrid::new(self.grid_rows, self.grid_cols, self.order)?;
        let block = BlockDescriptor::new(self.block.row_block, self.block.col_block)?;
        if !block_fits_slot(block) {
            return Err(BlacsError::InvalidGrid(format!(
                "{}x{} blocks exceed the {} byte message limit",
                block.row_block, block.col_block, MAX_MSG_SIZE
            )));
        }
        if grid.size() > MAX_PROCS {
            return Err(BlacsError::InvalidGrid(format!(
                "{}x{} grid needs {} processes, at most {} are supported",
                self.grid_rows,
                self.grid_cols,
                grid.size(),
                MAX_PROCS
            )));
        }
        if grid.rank_of(self.root)? != 0 {
            return Err(BlacsError::InvalidGrid(format!(
                "coordinator {} is not rank 0 under {:?} order",
                self.root,
                grid.order()
            )));
        }
        Ok(grid)
    }
}

/// Extract the input path from the process arguments (program name first).
pub fn parse_args<I>(args: I) -> Result<PathBuf>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    match (args.next(), args.next()) {
        (Some(path), None) => Ok(PathBuf::from(path)),
        (None, _) => Err(BlacsError::Usage("missing matrix file argument".into())),
        (Some(_), Some(extra)) => Err(BlacsError::Usage(format!("unexpected argument {:?}", extra))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_positional_argument() {
        let path = parse_args(args(&["simple-blacs", "matrix.txt"])).unwrap();
        assert_eq!(path, PathBuf::from("matrix.txt"));
    }

    #[test]
    fn test_wrong_argument_count() {
        assert!(matches!(parse_args(args(&["simple-blacs"])), Err(BlacsError::Usage(_))));
        let err = parse_args(args(&["simple-blacs", "a", "b"])).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_default_config_is_valid() {
        let grid = RunConfig::default().validate().unwrap();
        assert_eq!(grid.size(), 4);
        assert_eq!(grid.coordinate_of(1).unwrap(), GridCoord::new(1, 0));
    }

    #[test]
    fn test_rejects_bad_configs() {
        let zero_block = RunConfig {
            block: BlockDescriptor {
                row_block: 0,
                col_block: 2,
            },
            ..RunConfig::default()
        };
        assert!(zero_block.validate().is_err());

        let too_large = RunConfig {
            grid_rows: 8,
            grid_cols: 8,
            ..RunConfig::default()
        };
        assert!(too_large.validate().is_err());

        let remote_root = RunConfig {
            root: GridCoord::new(1, 1),
            ..RunConfig::default()
        };
        assert!(remote_root.validate().is_err());
    }

    #[test]
    fn test_block_must_fit_one_message() {
        let largest = RunConfig {
            block: BlockDescriptor {
                row_block: 256,
                col_block: MAX_MSG_SIZE / 8 / 256,
            },
            ..RunConfig::default()
        };
        assert!(largest.validate().is_ok());

        let oversized = RunConfig {
            block: BlockDescriptor {
                row_block: 1024,
                col_block: 1024,
            },
            ..RunConfig::default()
        };
        assert!(matches!(oversized.validate(), Err(BlacsError::InvalidGrid(_))));

        let overflowing = RunConfig {
            block: BlockDescriptor {
                row_block: usize::MAX,
                col_block: 2,
            },
            ..RunConfig::default()
        };
        assert!(overflowing.validate().is_err());
    }
}
