#![allow(clippy::needless_range_loop)]
//! Row-major tensor type used by the dense encoders and the interaction.
//!
//! Almost every tensor in the inference path is a `[batch, width]` matrix,
//! so besides the elementwise helpers this type offers row slicing and
//! row/column concatenation used when shards are scattered and gathered.

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};

/// A multi-dimensional array stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// The shape of the tensor (dimensions)
    shape: Vec<usize>,
    /// The underlying data in row-major order
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a new tensor with the given shape, filled with zeros.
    ///
    /// # Example
    ///
    /// ```
    /// use dlrm_layers::tensor::Tensor;
    ///
    /// let t = Tensor::zeros(&[2, 3]);
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert_eq!(t.numel(), 6);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Creates a new tensor with the given shape, filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![1.0; numel],
        }
    }

    /// Creates a new tensor with the given shape and data.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the shape. Use
    /// [`Tensor::try_from_data`] for caller-supplied buffers.
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            numel
        );
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Creates a tensor from an externally supplied buffer, checking its length.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] if `data.len()` differs from the
    /// element count of `shape`.
    pub fn try_from_data(shape: &[usize], data: Vec<f32>) -> LayerResult<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(LayerError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of rows of a 2D tensor.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of columns of a 2D tensor (1 for vectors).
    pub fn cols(&self) -> usize {
        if self.shape.len() >= 2 {
            self.shape[1]
        } else {
            1
        }
    }

    /// Returns a reference to the underlying data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the tensor and returns its buffer.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Borrows row `i` of a 2D tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let n = self.cols();
        &self.data[i * n..(i + 1) * n]
    }

    /// Copies rows `[start, end)` into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        assert!(start <= end && end <= self.rows(), "row range out of bounds");
        let n = self.cols();
        Tensor::from_data(&[end - start, n], self.data[start * n..end * n].to_vec())
    }

    /// Stacks 2D tensors of equal width vertically.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] when the widths differ.
    pub fn concat_rows(parts: &[Tensor]) -> LayerResult<Tensor> {
        let cols = parts.first().map(Tensor::cols).unwrap_or(0);
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.cols() != cols {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![part.rows(), cols],
                    actual: part.shape.clone(),
                });
            }
            rows += part.rows();
            data.extend_from_slice(&part.data);
        }
        Ok(Tensor::from_data(&[rows, cols], data))
    }

    /// Joins 2D tensors with the same row count side by side.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] when the row counts differ.
    pub fn concat_cols(parts: &[&Tensor]) -> LayerResult<Tensor> {
        let rows = parts.first().map(|t| t.rows()).unwrap_or(0);
        for part in parts {
            if part.rows() != rows {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![rows, part.cols()],
                    actual: part.shape.clone(),
                });
            }
        }
        let cols: usize = parts.iter().map(|t| t.cols()).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for part in parts {
                data.extend_from_slice(part.row(i));
            }
        }
        Ok(Tensor::from_data(&[rows, cols], data))
    }

    /// Matrix multiplication between two tensors.
    ///
    /// # Panics
    ///
    /// Panics if the inner dimensions don't match
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.ndim(), 2, "matmul requires 2D tensors");
        assert_eq!(other.ndim(), 2, "matmul requires 2D tensors");
        assert_eq!(
            self.shape[1], other.shape[0],
            "Inner dimensions must match for matmul"
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a = self.data[i * k + l];
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    result[i * n + j] += a * other.data[l * n + j];
                }
            }
        }

        Tensor::from_data(&[m, n], result)
    }

    /// Element-wise addition with broadcasting of a bias vector along rows.
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let data: Vec<f32> = self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a + b)
                .collect();
            Tensor::from_data(&self.shape, data)
        } else if self.ndim() == 2 && other.ndim() == 1 && self.shape[1] == other.shape[0] {
            // Broadcast along rows (bias addition)
            let mut data = self.data.clone();
            let n = self.shape[1];
            for i in 0..self.shape[0] {
                for j in 0..n {
                    data[i * n + j] += other.data[j];
                }
            }
            Tensor::from_data(&self.shape, data)
        } else {
            panic!(
                "Cannot broadcast shapes {:?} and {:?}",
                self.shape, other.shape
            );
        }
    }

    /// Apply a function element-wise.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        let data: Vec<f32> = self.data.iter().map(|&x| f(x)).collect();
        Tensor::from_data(&self.shape, data)
    }

    /// Clamps every element into `[min, max]`.
    pub fn clamp(&self, min: f32, max: f32) -> Tensor {
        self.map(|x| x.clamp(min, max))
    }

    /// Largest absolute elementwise difference against `other`.
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let t = Tensor::zeros(&[2, 3]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert!(t.data().iter().all(|&x| x == 0.0));

        let t = Tensor::ones(&[3, 2]);
        assert!(t.data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_try_from_data_rejects_bad_length() {
        assert!(Tensor::try_from_data(&[2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::try_from_data(&[2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn test_matmul() {
        let a = Tensor::from_data(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Tensor::from_data(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let c = a.matmul(&b);
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data()[0], 22.0); // 1*1 + 2*3 + 3*5
        assert_eq!(c.data()[1], 28.0); // 1*2 + 2*4 + 3*6
    }

    #[test]
    fn test_add_broadcast() {
        let a = Tensor::from_data(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Tensor::from_data(&[3], vec![10.0, 20.0, 30.0]);
        let c = a.add(&b);
        assert_eq!(c.data(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_row_slicing_and_concat() {
        let a = Tensor::from_data(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(a.row(1), &[3.0, 4.0]);

        let top = a.slice_rows(0, 1);
        let bottom = a.slice_rows(1, 3);
        assert_eq!(bottom.shape(), &[2, 2]);
        assert_eq!(Tensor::concat_rows(&[top, bottom]).unwrap(), a);

        let b = Tensor::from_data(&[3, 1], vec![7.0, 8.0, 9.0]);
        let joined = Tensor::concat_cols(&[&a, &b]).unwrap();
        assert_eq!(joined.shape(), &[3, 3]);
        assert_eq!(joined.row(2), &[5.0, 6.0, 9.0]);
    }

    #[test]
    fn test_concat_rejects_mismatched_parts() {
        let a = Tensor::zeros(&[2, 2]);
        let b = Tensor::zeros(&[2, 3]);
        assert!(Tensor::concat_rows(&[a.clone(), b.clone()]).is_err());
        let c = Tensor::zeros(&[1, 2]);
        assert!(Tensor::concat_cols(&[&a, &c]).is_err());
    }

    #[test]
    fn test_clamp() {
        let a = Tensor::from_data(&[1, 3], vec![-1.0, 0.5, 2.0]);
        assert_eq!(a.clamp(0.1, 0.9).data(), &[0.1, 0.5, 0.9]);
    }
}
