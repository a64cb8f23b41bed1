//! In-process grid: one thread per coordinate, channels for messages.
//!
//! [`run_on_grid`] simulates a full process grid inside one process, which
//! lets the scatter and gather protocols run under `cargo test` without
//! spawning anything. Messages use the same encodings and tags as
//! [`World`](crate::world::World).

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::comm::{decode_block, decode_value, encode_block, encode_value, Topology, Transport, TAG_BLOCK, TAG_BROADCAST};
use crate::grid::{GridCoord, ProcessGrid};
use crate::{BlacsError, Result};

struct Envelope {
    tag: i32,
    payload: Vec<u8>,
}

/// One simulated process. Channels are unbounded, so sends never block.
pub struct ThreadComm {
    grid: ProcessGrid,
    rank: usize,
    coord: GridCoord,
    // Indexed by destination rank.
    senders: Vec<Sender<Envelope>>,
    // Indexed by source rank.
    receivers: Vec<Receiver<Envelope>>,
    barrier: Arc<Barrier>,
}

impl ThreadComm {
    /// One communicator per rank, wired with a channel for every ordered pair.
    fn create_all(grid: ProcessGrid) -> Result<Vec<ThreadComm>> {
        let size = grid.size();
        let mut senders: Vec<Vec<Sender<Envelope>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Envelope>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = channel();
                senders[src].push(tx);
                receivers[dst].push(rx);
            }
        }

        let barrier = Arc::new(Barrier::new(size));
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| -> Result<ThreadComm> {
                Ok(ThreadComm {
                    grid,
                    rank,
                    coord: grid.coordinate_of(rank)?,
                    senders,
                    receivers,
                    barrier: Arc::clone(&barrier),
                })
            })
            .collect()
    }

    fn post(&self, dest: usize, tag: i32, payload: Vec<u8>) -> Result<()> {
        debug!("Rank {} sending {} bytes to rank {} with tag {}", self.rank, payload.len(), dest, tag);
        self.senders
            .get(dest)
            .ok_or(BlacsError::InvalidRank(dest))?
            .send(Envelope { tag, payload })
            .map_err(|_| BlacsError::CommunicationError(format!("rank {} hung up", dest)))
    }

    fn take(&self, source: usize, tag: i32) -> Result<Vec<u8>> {
        let envelope = self
            .receivers
            .get(source)
            .ok_or(BlacsError::InvalidRank(source))?
            .recv()
            .map_err(|_| BlacsError::CommunicationError(format!("rank {} hung up", source)))?;
        if envelope.tag != tag {
            return Err(BlacsError::CommunicationError(format!(
                "protocol mismatch: rank {} expected tag {} from rank {}, found tag {}",
                self.rank, tag, source, envelope.tag
            )));
        }
        Ok(envelope.payload)
    }
}

impl Topology for ThreadComm {
    fn grid(&self) -> &ProcessGrid {
        &self.grid
    }

    fn coordinate(&self) -> GridCoord {
        self.coord
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}

impl Transport for ThreadComm {
    fn send(&self, buffer: &[f64], rows: usize, cols: usize, stride: usize, dest: GridCoord) -> Result<()> {
        let dest = self.grid.rank_of(dest)?;
        self.post(dest, TAG_BLOCK, encode_block(buffer, rows, cols, stride)?)
    }

    fn receive(
        &self,
        buffer: &mut [f64],
        rows: usize,
        cols: usize,
        stride: usize,
        source: GridCoord,
    ) -> Result<()> {
        let source = self.grid.rank_of(source)?;
        let payload = self.take(source, TAG_BLOCK)?;
        decode_block(&payload, buffer, rows, cols, stride)
    }

    fn broadcast<T>(&self, value: &T, root: GridCoord) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let root = self.grid.rank_of(root)?;
        if self.rank == root {
            let payload = encode_value(value)?;
            for rank in (0..self.grid.size()).filter(|&r| r != root) {
                self.post(rank, TAG_BROADCAST, payload.clone())?;
            }
            Ok(value.clone())
        } else {
            decode_value(&self.take(root, TAG_BROADCAST)?)
        }
    }
}

/// Run `f` once per grid coordinate, each on its own thread, and collect the
/// results in rank order.
///
/// A failing rank drops its channels, which turns its peers' pending receives
/// into errors; a rank that fails while others wait in
/// [`Topology::barrier`] leaves them blocked.
pub fn run_on_grid<T, F>(grid: ProcessGrid, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&ThreadComm) -> Result<T> + Sync,
{
    let comms = ThreadComm::create_all(grid)?;
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(&comm)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(BlacsError::ProcessError(format!("rank {} panicked", rank))),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RankOrder;

    #[test]
    fn test_ranks_and_coordinates() {
        let grid = ProcessGrid::new(2, 3, RankOrder::RowMajor).unwrap();
        let seen = run_on_grid(grid, |comm| Ok((comm.rank(), comm.coordinate()))).unwrap();
        assert_eq!(seen.len(), 6);
        for (rank, (r, coord)) in seen.into_iter().enumerate() {
            assert_eq!(r, rank);
            assert_eq!(coord, grid.coordinate_of(rank).unwrap());
        }
    }

    #[test]
    fn test_broadcast_from_non_zero_root() {
        let grid = ProcessGrid::new(2, 2, RankOrder::ColumnMajor).unwrap();
        let root = GridCoord::new(1, 1);
        let values = run_on_grid(grid, |comm| {
            let mine = if comm.coordinate() == root { vec![7u32, 8, 9] } else { Vec::new() };
            comm.broadcast(&mine, root)
        })
        .unwrap();
        assert!(values.iter().all(|v| v == &vec![7, 8, 9]));
    }

    #[test]
    fn test_send_to_self_then_receive() {
        let grid = ProcessGrid::new(1, 1, RankOrder::RowMajor).unwrap();
        let out = run_on_grid(grid, |comm| {
            let me = comm.coordinate();
            comm.send(&[1.0, 2.0, 3.0, 4.0], 2, 2, 2, me)?;
            let mut buf = vec![0.0; 4];
            comm.receive(&mut buf, 2, 2, 2, me)?;
            comm.barrier()?;
            Ok(buf)
        })
        .unwrap();
        assert_eq!(out[0], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_tag_mismatch_is_a_protocol_error() {
        let grid = ProcessGrid::new(1, 2, RankOrder::RowMajor).unwrap();
        let results = run_on_grid(grid, |comm| {
            if comm.rank() == 0 {
                comm.post(1, TAG_BROADCAST, vec![0u8; 8])?;
                Ok(())
            } else {
                let mut buf = [0.0];
                comm.receive(&mut buf, 1, 1, 1, GridCoord::new(0, 0))
            }
        });
        assert!(matches!(results, Err(BlacsError::CommunicationError(_))));
    }
}
