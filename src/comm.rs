//! The narrow interface the distribution code consumes.
//!
//! [`Topology`] answers "where am I in the grid" and synchronizes;
//! [`Transport`] moves matrix blocks and broadcasts small control values.
//! Both are addressed by [`GridCoord`], never by raw rank, so the scheduler
//! is independent of the rank ordering a runtime picks.

use serde::{de::DeserializeOwned, Serialize};

use crate::grid::{GridCoord, ProcessGrid};
use crate::matrix::{pack_block, unpack_block};
use crate::{BlacsError, Result};

/// Tag for broadcast control values.
pub(crate) const TAG_BROADCAST: i32 = 1;
/// Tag for matrix block payloads.
pub(crate) const TAG_BLOCK: i32 = 2;
pub(crate) const TAG_BARRIER_ARRIVE: i32 = -1;
pub(crate) const TAG_BARRIER_COMPLETE: i32 = -2;

pub trait Topology {
    fn grid(&self) -> &ProcessGrid;

    /// This process's coordinate, fixed for the lifetime of the grid.
    fn coordinate(&self) -> GridCoord;

    /// Linear rank of this process under the grid's rank order.
    fn rank(&self) -> usize;

    /// Block until every process in the grid has entered the barrier.
    fn barrier(&self) -> Result<()>;
}

/// Blocking point-to-point block transfer and root broadcast.
///
/// `send` may return before the matching `receive` is posted (sends are
/// buffered at least one message deep per ordered pair), which is what lets a
/// process send a block to itself and then receive it.
pub trait Transport {
    /// Send the `rows x cols` block starting at `buffer[0]`, whose columns are
    /// `stride` elements apart, to `dest`.
    fn send(&self, buffer: &[f64], rows: usize, cols: usize, stride: usize, dest: GridCoord) -> Result<()>;

    /// Receive a `rows x cols` block from `source` into `buffer`, whose columns
    /// are `stride` elements apart.
    fn receive(
        &self,
        buffer: &mut [f64],
        rows: usize,
        cols: usize,
        stride: usize,
        source: GridCoord,
    ) -> Result<()>;

    /// Collective: every process passes a value, all get the root's back.
    fn broadcast<T>(&self, value: &T, root: GridCoord) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone;
}

/// Encode a strided block as the wire payload shared by all transports.
pub(crate) fn encode_block(buffer: &[f64], rows: usize, cols: usize, stride: usize) -> Result<Vec<u8>> {
    let packed = pack_block(buffer, rows, cols, stride)?;
    Ok(bytemuck::cast_slice::<f64, u8>(&packed).to_vec())
}

/// Decode a wire payload into a strided destination block.
pub(crate) fn decode_block(
    payload: &[u8],
    buffer: &mut [f64],
    rows: usize,
    cols: usize,
    stride: usize,
) -> Result<()> {
    let width = std::mem::size_of::<f64>();
    if payload.len() != rows * cols * width {
        return Err(BlacsError::CommunicationError(format!(
            "expected a {}x{} block ({} bytes), got {} bytes",
            rows,
            cols,
            rows * cols * width,
            payload.len()
        )));
    }
    // Payload bytes carry no alignment guarantee, so copy into an f64 buffer.
    let mut packed = vec![0.0f64; rows * cols];
    bytemuck::cast_slice_mut::<f64, u8>(&mut packed).copy_from_slice(payload);
    unpack_block(&packed, buffer, rows, cols, stride)
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| BlacsError::SerializationError(e.to_string()))
}

pub(crate) fn decode_value<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| BlacsError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_payload_roundtrip_with_strides() {
        // 3x2 block out of a buffer with stride 4, into a buffer with stride 3
        let src: Vec<f64> = (0..8).map(|x| x as f64).collect();
        let payload = encode_block(&src, 3, 2, 4).unwrap();
        assert_eq!(payload.len(), 6 * 8);

        let mut dst = vec![-1.0; 6];
        decode_block(&payload, &mut dst, 3, 2, 3).unwrap();
        assert_eq!(dst, vec![0.0, 1.0, 2.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_decode_rejects_size_mismatch() {
        let payload = encode_block(&[1.0, 2.0], 2, 1, 2).unwrap();
        let mut dst = vec![0.0; 4];
        assert!(matches!(
            decode_block(&payload, &mut dst, 2, 2, 2),
            Err(BlacsError::CommunicationError(_))
        ));
    }

    #[test]
    fn test_value_encoding() {
        let bytes = encode_value(&(4usize, 5usize)).unwrap();
        let dims: (usize, usize) = decode_value(&bytes).unwrap();
        assert_eq!(dims, (4, 5));
    }
}
