//! Scatter and gather over the shared-memory runtime.
//!
//! The runtime re-executes the current binary for every rank, so this test
//! runs without the libtest harness: each spawned copy enters `main` again
//! and joins the same grid.

use simple_blacs::{
    BlacsError, BlockDescriptor, GlobalMatrix, GridCoord, GridWorld, Matrix, ProcessGrid, RankOrder, Result,
    ScatterScheduler, Topology,
};

const UNEXPECTED_TAG: i32 = 7;

fn value_at(i: usize, j: usize) -> f64 {
    (i * 10 + j) as f64 + 0.5
}

fn sample(m: usize, n: usize) -> Result<Matrix> {
    let data = (0..n).flat_map(|j| (0..m).map(move |i| value_at(i, j))).collect();
    Matrix::from_column_major(m, n, data)
}

fn check(condition: bool, what: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(BlacsError::CommunicationError(what.to_string()))
    }
}

fn roundtrip(comm: &GridWorld) -> Result<()> {
    let (m, n) = (7, 5);
    let root = GridCoord::new(0, 0);
    let scheduler = ScatterScheduler::new(BlockDescriptor::new(2, 3)?, root);

    let global = if comm.coordinate() == root {
        GlobalMatrix::Present(sample(m, n)?)
    } else {
        GlobalMatrix::Absent
    };
    let local = scheduler.scatter(comm, global)?;
    let back = scheduler.gather(comm, &local)?;

    let (rows, cols) = local.matrix().shape();
    let mut expected = Vec::with_capacity(rows * cols);
    for lj in 0..cols {
        for li in 0..rows {
            let (i, j) = local
                .global_index(li, lj)
                .ok_or_else(|| BlacsError::ShapeMismatch(format!("({}, {}) has no global index", li, lj)))?;
            expected.push(value_at(i, j));
        }
    }
    check(local.into_matrix().as_slice() == expected.as_slice(), "local share differs")?;

    match back.into_matrix() {
        Some(gathered) => {
            check(comm.coordinate() == root, "gathered matrix away from the root")?;
            check(gathered == sample(m, n)?, "gathered matrix differs")
        }
        None => check(comm.coordinate() != root, "root gathered nothing"),
    }
}

fn tag_mismatch(comm: &GridWorld) -> Result<()> {
    comm.barrier()?;
    let world = comm.world();
    match world.rank() {
        0 => {
            let err = world.recv_bytes(1, UNEXPECTED_TAG + 1);
            check(
                matches!(err, Err(BlacsError::CommunicationError(ref msg)) if msg.contains("protocol mismatch")),
                "mismatched tag was accepted",
            )?;
            // The message stays in its slot for a receive with the right tag.
            world.recv::<()>(1, UNEXPECTED_TAG)
        }
        1 => world.send(&(), 0, UNEXPECTED_TAG),
        _ => Ok(()),
    }
}

fn main() {
    let _ = env_logger::builder().is_test(true).try_init();

    let grid = ProcessGrid::new(2, 2, RankOrder::ColumnMajor).unwrap();
    let comm = GridWorld::init(grid).unwrap();

    if let Err(e) = roundtrip(&comm).and_then(|_| tag_mismatch(&comm)) {
        eprintln!("rank {} failed: {}", comm.rank(), e);
        comm.abort(1);
    }

    let rank = comm.rank();
    comm.finalize().unwrap();
    if rank == 0 {
        println!("grid_world: ok");
    }
}
