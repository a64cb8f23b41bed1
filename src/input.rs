//! Plain-text matrix files.
//!
//! The format is two integers `m n` followed by `m * n` real numbers listed
//! row by row, all separated by arbitrary whitespace.

use std::fs;
use std::path::Path;

use log::debug;

use crate::matrix::Matrix;
use crate::{BlacsError, Result};

pub fn read_matrix(path: &Path) -> Result<Matrix> {
    let text = fs::read_to_string(path).map_err(|source| BlacsError::Input {
        path: path.display().to_string(),
        source,
    })?;
    let matrix = parse_matrix(&text)?;
    debug!("Read a {}x{} matrix from {:?}", matrix.rows(), matrix.cols(), path);
    Ok(matrix)
}

pub fn parse_matrix(text: &str) -> Result<Matrix> {
    let mut tokens = text.split_whitespace();
    let rows = parse_extent(tokens.next(), "row count")?;
    let cols = parse_extent(tokens.next(), "column count")?;
    let count = rows
        .checked_mul(cols)
        .ok_or_else(|| BlacsError::Parse(format!("a {}x{} matrix is too large", rows, cols)))?;

    let mut values = Vec::with_capacity(count.min(1 << 20));
    for k in 0..count {
        let token = tokens.next().ok_or_else(|| {
            BlacsError::Parse(format!("expected {} values, found only {}", count, k))
        })?;
        let value = token
            .parse::<f64>()
            .map_err(|e| BlacsError::Parse(format!("value {} ({:?}): {}", k, token, e)))?;
        values.push(value);
    }

    if let Some(extra) = tokens.next() {
        return Err(BlacsError::Parse(format!(
            "unexpected trailing data {:?} after {} values",
            extra, count
        )));
    }

    Matrix::from_row_major(rows, cols, &values)
}

fn parse_extent(token: Option<&str>, what: &str) -> Result<usize> {
    let token = token.ok_or_else(|| BlacsError::Parse(format!("missing {}", what)))?;
    token
        .parse::<usize>()
        .map_err(|e| BlacsError::Parse(format!("{} {:?}: {}", what, token, e)))
}
