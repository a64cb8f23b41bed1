//! Block-cyclic distribution of a dense matrix over a 2-D process grid.
//!
//! One coordinating process holds a full matrix; every process in a
//! `rows x cols` grid ends up with its block-cyclic share of it, laid out the
//! way parallel dense linear algebra libraries expect.
//!
//! # Features
//!
//! - **Distribution arithmetic**: local extents, owner lookup and the
//!   global/local index mapping ([`distribution`])
//! - **Scatter and gather**: a deterministic block schedule replayed by every
//!   process ([`ScatterScheduler`])
//! - **Shared-memory runtime**: spawns one process per grid coordinate on a
//!   single machine ([`World`], [`GridWorld`])
//! - **Threaded grid**: the same protocol on threads, for tests
//!   ([`threaded::run_on_grid`])
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use simple_blacs::{BlockDescriptor, GlobalMatrix, GridCoord, GridWorld, Matrix};
//! use simple_blacs::{ProcessGrid, RankOrder, ScatterScheduler, Topology, World};
//!
//! let grid = ProcessGrid::new(2, 2, RankOrder::ColumnMajor).unwrap();
//! let global = if World::is_spawned() {
//!     GlobalMatrix::Absent
//! } else {
//!     GlobalMatrix::Present(Matrix::zeros(4, 5))
//! };
//!
//! let comm = GridWorld::init(grid).unwrap();
//! let block = BlockDescriptor::new(2, 3).unwrap();
//! let local = ScatterScheduler::new(block, GridCoord::new(0, 0))
//!     .scatter(&comm, global)
//!     .unwrap();
//! println!("{} holds {:?}", comm.coordinate(), local.matrix().shape());
//! comm.finalize().unwrap();
//! ```
//!
//! # Error Handling
//!
//! All operations return a `Result` with [`BlacsError`]. Errors raised while a
//! scatter or gather is in flight leave the processes out of step and are
//! fatal for the whole run.

use thiserror::Error;

pub mod comm;
pub mod config;
pub mod distribution;
pub mod grid;
pub mod input;
pub mod matrix;
pub mod report;
pub mod scatter;
pub mod threaded;
pub mod world;

pub use comm::{Topology, Transport};
pub use config::RunConfig;
pub use distribution::{local_extent, BlockAssignment, BlockDescriptor, BlockSchedule, Distribution};
pub use grid::{GridCoord, ProcessGrid, RankOrder};
pub use matrix::Matrix;
pub use scatter::{GlobalMatrix, LocalMatrix, ScatterScheduler};
pub use world::{GridWorld, World};

#[derive(Error, Debug)]
pub enum BlacsError {
    #[error("Invalid rank: {0}")]
    InvalidRank(usize),
    #[error("Invalid grid coordinate: ({row}, {col})")]
    InvalidCoordinate { row: usize, col: usize },
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("Initialization error: {0}")]
    InitError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Process error: {0}")]
    ProcessError(String),
    #[error("Run aborted by another process")]
    Aborted,
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Malformed matrix file: {0}")]
    Parse(String),
    #[error("Cannot read {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Usage(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlacsError {
    /// Errors caused by how the program was invoked or configured, as opposed
    /// to failures of the distributed run itself.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BlacsError::Usage(_) | BlacsError::Input { .. } | BlacsError::Parse(_) | BlacsError::InvalidGrid(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BlacsError>;
