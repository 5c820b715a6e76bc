//! Host-side matrices.
//!
//! [`HostMatrix`] is the row-major buffer the pipeline fills and hands
//! back to the caller.  Its shape travels with it, so buffer sizing, grid
//! computation and printing all derive from the same `(rows, cols)`.

use std::fmt::{self, Write as _};
use std::io;

use bytemuck::Pod;

use crate::error::{DispatchError, Result};
use crate::grid::Extent2;

/// The `(rows, cols)` shape of a row-major matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixShape {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of elements, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Number of bytes needed to store the matrix as `T`.
    ///
    /// Fails with [`DispatchError::Config`] when the size does not fit in
    /// a `u64`.
    pub fn byte_len<T: Pod>(&self) -> Result<u64> {
        let elem = std::mem::size_of::<T>() as u64;
        (self.rows as u64)
            .checked_mul(self.cols as u64)
            .and_then(|n| n.checked_mul(elem))
            .ok_or_else(|| {
                DispatchError::Config(format!("a {self} matrix of {elem}-byte elements overflows"))
            })
    }

    /// The global work extent covering one invocation per cell:
    /// `x` spans columns and `y` spans rows.
    pub fn extent(&self) -> Result<Extent2> {
        let axis = |n: usize, name: &str| {
            u32::try_from(n)
                .map_err(|_| DispatchError::Config(format!("{name} = {n} does not fit a work grid")))
        };
        Ok(Extent2::new(axis(self.cols, "cols")?, axis(self.rows, "rows")?))
    }
}

impl fmt::Display for MatrixShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A row-major host buffer with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMatrix<T> {
    shape: MatrixShape,
    data: Vec<T>,
}

impl<T: Pod> HostMatrix<T> {
    /// A zero-filled matrix.
    pub fn zeroed(shape: MatrixShape) -> Self {
        Self {
            shape,
            data: vec![T::zeroed(); shape.len()],
        }
    }

    /// Wrap existing row-major data.  The length must match the shape.
    pub fn from_vec(shape: MatrixShape, data: Vec<T>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(DispatchError::Shape {
                expected: shape.len(),
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Fill a matrix from a function of `(row, col)`.
    pub fn from_fn(shape: MatrixShape, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(shape.len());
        for row in 0..shape.rows {
            for col in 0..shape.cols {
                data.push(f(row, col));
            }
        }
        Self { shape, data }
    }

    pub fn shape(&self) -> MatrixShape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    /// Element at `(row, col)`, or `None` when out of range.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row < self.shape.rows && col < self.shape.cols {
            self.data.get(row * self.shape.cols + col).copied()
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Iterate over rows.
    pub fn row_iter(&self) -> impl Iterator<Item = &[T]> {
        // chunks(0) panics; an empty matrix simply has no rows.
        self.data.chunks(self.shape.cols.max(1)).take(self.shape.rows)
    }
}

impl<T: Pod + fmt::Display> HostMatrix<T> {
    /// Render the matrix as text, one row per line, each cell followed
    /// by a space.  `precision` applies to floating point types.
    pub fn render(&self, precision: Option<usize>) -> String {
        let mut out = String::new();
        for row in self.row_iter() {
            for value in row {
                let _ = match precision {
                    Some(p) => write!(out, "{value:.p$} "),
                    None => write!(out, "{value} "),
                };
            }
            out.push('\n');
        }
        out
    }

    /// Write the rendered matrix to `writer`.
    pub fn write_to(&self, mut writer: impl io::Write, precision: Option<usize>) -> io::Result<()> {
        writer.write_all(self.render(precision).as_bytes())
    }
}
