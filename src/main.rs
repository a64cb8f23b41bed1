use std::process;

use log::{error, info};

use simple_blacs::config::{parse_args, RunConfig, USAGE};
use simple_blacs::input::read_matrix;
use simple_blacs::report::{format_coordinate, format_local, in_rank_order};
use simple_blacs::{BlacsError, GlobalMatrix, GridWorld, Result, ScatterScheduler, Topology, World};

/// Bad arguments, unreadable input or invalid configuration.
const EXIT_CONFIG: i32 = 2;
/// Failure of the distributed run.
const EXIT_RUNTIME: i32 = 1;

fn main() {
    env_logger::init();

    let path = match parse_args(std::env::args()) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", USAGE);
            process::exit(EXIT_CONFIG);
        }
    };

    let config = RunConfig::default();
    let grid = match config.validate() {
        Ok(grid) => grid,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    // The launching process is the coordinator and reads the input before
    // any other process exists.
    let global = if World::is_spawned() {
        GlobalMatrix::Absent
    } else {
        match read_matrix(&path) {
            Ok(matrix) => GlobalMatrix::Present(matrix),
            Err(e) => {
                eprintln!("{}", e);
                process::exit(EXIT_CONFIG);
            }
        }
    };

    let comm = match GridWorld::init(grid) {
        Ok(comm) => comm,
        Err(e) => {
            error!("Grid initialization failed: {}", e);
            process::exit(EXIT_RUNTIME);
        }
    };

    if let Err(e) = run(&comm, &config, global) {
        error!("Process {} failed: {}", comm.rank(), e);
        comm.abort(EXIT_RUNTIME);
    }

    if let Err(e) = comm.finalize() {
        error!("Shutdown failed: {}", e);
        process::exit(EXIT_RUNTIME);
    }
}

fn run(comm: &GridWorld, config: &RunConfig, global: GlobalMatrix) -> Result<()> {
    if comm.rank() == 0 {
        println!("=============================================");
        println!("Process grid coordinates:");
        println!("=============================================");
    }
    in_rank_order(comm, || {
        println!("{}", format_coordinate(comm.rank(), comm.coordinate()));
        Ok(())
    })?;

    // Same table again, derived from the rank; it must agree with the
    // coordinate the runtime assigned.
    if comm.rank() == 0 {
        println!("=============================================");
        println!("Process grid coordinates (from rank):");
        println!("=============================================");
    }
    in_rank_order(comm, || {
        let derived = comm.grid().coordinate_of(comm.rank())?;
        if derived != comm.coordinate() {
            return Err(BlacsError::InitError(format!(
                "rank {} maps to {} but runs at {}",
                comm.rank(),
                derived,
                comm.coordinate()
            )));
        }
        println!("{}", format_coordinate(comm.rank(), derived));
        Ok(())
    })?;

    let scheduler = ScatterScheduler::new(config.block, config.root);
    info!(
        "Scattering from {} in {}x{} blocks",
        scheduler.root(),
        scheduler.block().row_block,
        scheduler.block().col_block
    );
    let local = scheduler.scatter(comm, global)?;
    info!("Process {} holds its share", comm.coordinate());

    if comm.rank() == 0 {
        println!("=============================================");
        println!("Local matrices:");
        println!("=============================================");
    }
    in_rank_order(comm, || {
        print!("{}", format_local(comm.rank(), &local));
        Ok(())
    })
}
