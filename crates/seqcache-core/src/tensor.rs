//! Host-side storage for per-layer cache buffers.

use crate::config::DType;

/// A 2-D buffer of `n_rows` rows, each holding `ne0` elements of `dtype`.
///
/// The memory layer never interprets element values. Rows are opaque byte
/// slices that the compute step fills and the state codec copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorBuf {
    name: String,
    dtype: DType,
    ne0: usize,
    n_rows: usize,
    row_bytes: usize,
    data: Vec<u8>,
}

impl TensorBuf {
    /// Allocate a zeroed buffer.
    pub fn zeros(name: impl Into<String>, dtype: DType, ne0: usize, n_rows: usize) -> Self {
        let row_bytes = dtype.row_size(ne0);
        Self {
            name: name.into(),
            dtype,
            ne0,
            n_rows,
            row_bytes,
            data: vec![0; row_bytes * n_rows],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Elements per row.
    pub fn ne0(&self) -> usize {
        self.ne0
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Bytes per row.
    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// Total size in bytes.
    pub fn n_bytes(&self) -> usize {
        self.data.len()
    }

    /// Row `i`. Panics if out of range.
    pub fn row(&self, i: usize) -> &[u8] {
        let start = i * self.row_bytes;
        &self.data[start..start + self.row_bytes]
    }

    /// Mutable row `i`. Panics if out of range.
    pub fn row_mut(&mut self, i: usize) -> &mut [u8] {
        let start = i * self.row_bytes;
        &mut self.data[start..start + self.row_bytes]
    }

    /// Rows `[first, first + n)` as one contiguous slice.
    pub fn rows(&self, first: usize, n: usize) -> &[u8] {
        let start = first * self.row_bytes;
        &self.data[start..start + n * self.row_bytes]
    }

    /// Mutable rows `[first, first + n)`.
    pub fn rows_mut(&mut self, first: usize, n: usize) -> &mut [u8] {
        let start = first * self.row_bytes;
        &mut self.data[start..start + n * self.row_bytes]
    }

    /// Copy row `src` onto row `dst` within the buffer.
    pub fn copy_row(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let rb = self.row_bytes;
        self.data.copy_within(src * rb..(src + 1) * rb, dst * rb);
    }

    /// Zero row `i`.
    pub fn zero_row(&mut self, i: usize) {
        self.row_mut(i).fill(0);
    }

    /// Zero the whole buffer.
    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw bytes, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_layout() {
        let buf = TensorBuf::zeros("cache_k_l0", DType::F16, 8, 4);
        assert_eq!(buf.name(), "cache_k_l0");
        assert_eq!(buf.row_bytes(), 16);
        assert_eq!(buf.n_bytes(), 64);
        assert!(buf.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_and_zero_rows() {
        let mut buf = TensorBuf::zeros("t", DType::F32, 2, 3);
        buf.row_mut(0).fill(7);
        buf.copy_row(0, 2);
        assert_eq!(buf.row(2), &[7; 8]);
        assert_eq!(buf.row(1), &[0; 8]);

        buf.zero_row(0);
        assert_eq!(buf.row(0), &[0; 8]);
        assert_eq!(buf.rows(1, 2).len(), 16);
    }
}
