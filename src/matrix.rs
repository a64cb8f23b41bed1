//! Dense column-major matrix storage.
//!
//! The same type backs the full matrix on the coordinator and every local
//! matrix, so block packing and unpacking share one linearization:
//! `linear_index(i, j) = j * rows + i`.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::{BlacsError, Result};

/// A dense `rows x cols` matrix of `f64` stored column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Create a zero-filled matrix. Either extent may be zero.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap an existing column-major buffer.
    pub fn from_column_major(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(BlacsError::ShapeMismatch(format!(
                "{} values cannot fill a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from values listed row after row.
    pub fn from_row_major(rows: usize, cols: usize, values: &[f64]) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(BlacsError::ShapeMismatch(format!(
                "{} values cannot fill a {}x{} matrix",
                values.len(),
                rows,
                cols
            )));
        }
        let mut matrix = Self::zeros(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                matrix[(i, j)] = values[i * cols + j];
            }
        }
        Ok(matrix)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Physical offset of element `(i, j)`. Not bounds-checked.
    #[inline]
    pub fn linear_index(&self, i: usize, j: usize) -> usize {
        j * self.rows + i
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        if i < self.rows && j < self.cols {
            Some(self.data[self.linear_index(i, j)])
        } else {
            None
        }
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) -> Result<()> {
        if i >= self.rows || j >= self.cols {
            return Err(BlacsError::ShapeMismatch(format!(
                "({}, {}) is outside a {}x{} matrix",
                i, j, self.rows, self.cols
            )));
        }
        let idx = self.linear_index(i, j);
        self.data[idx] = value;
        Ok(())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Leading dimension (row stride between consecutive columns).
    pub fn stride(&self) -> usize {
        self.rows
    }

    /// The buffer starting at element `(i, j)`, as handed to a transport
    /// together with [`Matrix::stride`].
    pub fn tail_from(&self, i: usize, j: usize) -> &[f64] {
        &self.data[self.linear_index(i, j)..]
    }

    pub fn tail_from_mut(&mut self, i: usize, j: usize) -> &mut [f64] {
        let idx = self.linear_index(i, j);
        &mut self.data[idx..]
    }

    fn check_block(&self, i: usize, j: usize, rows: usize, cols: usize) -> Result<()> {
        if i + rows > self.rows || j + cols > self.cols {
            return Err(BlacsError::ShapeMismatch(format!(
                "{}x{} block at ({}, {}) exceeds a {}x{} matrix",
                rows, cols, i, j, self.rows, self.cols
            )));
        }
        Ok(())
    }

    /// Copy the `rows x cols` block at `(i, j)` into a contiguous buffer.
    pub fn block(&self, i: usize, j: usize, rows: usize, cols: usize) -> Result<Vec<f64>> {
        self.check_block(i, j, rows, cols)?;
        if rows == 0 || cols == 0 {
            return Ok(Vec::new());
        }
        pack_block(self.tail_from(i, j), rows, cols, self.rows)
    }

    /// Overwrite the `rows x cols` block at `(i, j)` from a contiguous buffer.
    pub fn set_block(&mut self, i: usize, j: usize, rows: usize, cols: usize, packed: &[f64]) -> Result<()> {
        self.check_block(i, j, rows, cols)?;
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        let stride = self.rows;
        unpack_block(packed, self.tail_from_mut(i, j), rows, cols, stride)
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    /// Panics when `(i, j)` is out of bounds.
    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        assert!(i < self.rows && j < self.cols, "index ({}, {}) out of bounds", i, j);
        &self.data[j * self.rows + i]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        assert!(i < self.rows && j < self.cols, "index ({}, {}) out of bounds", i, j);
        &mut self.data[j * self.rows + i]
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.rows {
            for j in 0..self.cols {
                if j > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{:8.3}", self[(i, j)])?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Gather a strided `rows x cols` block into a contiguous column-major vector.
///
/// `src` starts at the block's first element; consecutive columns are
/// `stride` elements apart.
pub fn pack_block(src: &[f64], rows: usize, cols: usize, stride: usize) -> Result<Vec<f64>> {
    check_strided(src.len(), rows, cols, stride)?;
    let mut packed = Vec::with_capacity(rows * cols);
    for j in 0..cols {
        let start = j * stride;
        packed.extend_from_slice(&src[start..start + rows]);
    }
    Ok(packed)
}

/// Scatter a contiguous column-major block into a strided destination.
pub fn unpack_block(packed: &[f64], dst: &mut [f64], rows: usize, cols: usize, stride: usize) -> Result<()> {
    if packed.len() != rows * cols {
        return Err(BlacsError::ShapeMismatch(format!(
            "received {} values for a {}x{} block",
            packed.len(),
            rows,
            cols
        )));
    }
    check_strided(dst.len(), rows, cols, stride)?;
    for (j, column) in packed.chunks_exact(rows.max(1)).enumerate().take(cols) {
        let start = j * stride;
        dst[start..start + rows].copy_from_slice(column);
    }
    Ok(())
}

fn check_strided(len: usize, rows: usize, cols: usize, stride: usize) -> Result<()> {
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    if stride < rows || (cols - 1) * stride + rows > len {
        return Err(BlacsError::ShapeMismatch(format!(
            "{}x{} block with stride {} does not fit a buffer of {} values",
            rows, cols, stride, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_major_linearization() {
        let m = Matrix::from_row_major(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(m.linear_index(1, 2), 5);
        assert_eq!(m[(1, 2)], 6.0);
        assert_eq!(m.get(2, 0), None);
    }

    #[test]
    fn test_set_out_of_bounds() {
        let mut m = Matrix::zeros(2, 2);
        assert!(m.set(1, 1, 3.5).is_ok());
        assert_eq!(m.get(1, 1), Some(3.5));
        assert!(matches!(m.set(2, 0, 1.0), Err(BlacsError::ShapeMismatch(_))));
    }

    #[test]
    fn test_block_extraction_honors_stride() {
        // 3x3 matrix with value 10*i + j
        let values: Vec<f64> = (0..3)
            .flat_map(|i| (0..3).map(move |j| (10 * i + j) as f64))
            .collect();
        let m = Matrix::from_row_major(3, 3, &values).unwrap();
        let block = m.block(1, 1, 2, 2).unwrap();
        assert_eq!(block, vec![11.0, 21.0, 12.0, 22.0]);
    }

    #[test]
    fn test_set_block_into_local_offset() {
        let mut local = Matrix::zeros(4, 3);
        local.set_block(2, 1, 2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(local[(2, 1)], 1.0);
        assert_eq!(local[(3, 1)], 2.0);
        assert_eq!(local[(2, 2)], 3.0);
        assert_eq!(local[(3, 2)], 4.0);
        assert_eq!(local[(0, 0)], 0.0);
    }

    #[test]
    fn test_block_out_of_range() {
        let m = Matrix::zeros(2, 2);
        assert!(m.block(1, 1, 2, 1).is_err());
        assert!(m.block(0, 0, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_unpack_rejects_wrong_length() {
        let mut dst = vec![0.0; 6];
        assert!(unpack_block(&[1.0, 2.0, 3.0], &mut dst, 2, 2, 3).is_err());
    }
}
