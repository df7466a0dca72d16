//! Tensor representations for dense, ragged and sparse feature columns

use std::fmt;

use ndarray::{Array2, ArcArray, IxDyn};

use crate::error::{Error, Result};

/// Dense tensor flowing between blocks.
///
/// Backed by a reference-counted array so bundles can be fanned out to
/// several branches without copying the data.
pub type Tensor = ArcArray<f32, IxDyn>;

/// Build a dense tensor from row-major data
pub fn tensor_from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Tensor> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(Error::InvalidArgument(format!(
            "Data length {} does not match shape product {}",
            data.len(),
            expected
        )));
    }

    Ok(ndarray::Array::from_shape_vec(IxDyn(shape), data)?.into_shared())
}

/// Flatten a tensor to `(batch, features)`.
///
/// A rank-1 tensor is treated as one feature per row.
pub fn flatten_2d(tensor: &Tensor) -> Result<Array2<f32>> {
    let shape = tensor.shape();
    let Some((&batch, rest)) = shape.split_first() else {
        return Err(Error::ShapeInconsistency(
            "cannot flatten a scalar tensor".into(),
        ));
    };
    let width = rest.iter().product::<usize>();

    Ok(tensor.to_shape((batch, width))?.into_owned())
}

/// A multi-valued column: a flat run of values split into rows
#[derive(Clone, PartialEq)]
pub struct RaggedTensor {
    values: Vec<f32>,
    row_lengths: Vec<usize>,
}

impl RaggedTensor {
    /// Create a ragged tensor, checking that the row lengths cover the values exactly
    pub fn new(values: Vec<f32>, row_lengths: Vec<usize>) -> Result<Self> {
        let total: usize = row_lengths.iter().sum();
        if total != values.len() {
            return Err(Error::ShapeInconsistency(format!(
                "row lengths sum to {} but there are {} values",
                total,
                values.len()
            )));
        }

        Ok(Self {
            values,
            row_lengths,
        })
    }

    /// Create a ragged tensor from explicit rows
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Self {
        let row_lengths = rows.iter().map(|r| r.as_ref().len()).collect();
        let values = rows.iter().flat_map(|r| r.as_ref().iter().copied()).collect();

        Self {
            values,
            row_lengths,
        }
    }

    /// Flat values
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of values in each row
    pub fn row_lengths(&self) -> &[usize] {
        &self.row_lengths
    }

    /// Number of rows
    pub fn batch_size(&self) -> usize {
        self.row_lengths.len()
    }

    /// Length of the longest row
    pub fn max_row_length(&self) -> usize {
        self.row_lengths.iter().copied().max().unwrap_or(0)
    }

    /// Iterate over the rows as slices
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        let mut offset = 0;
        self.row_lengths.iter().map(move |&len| {
            let row = &self.values[offset..offset + len];
            offset += len;
            row
        })
    }

    /// Pad (or truncate) every row to `max_len` columns, filling with zeros.
    ///
    /// Without an explicit length the longest row decides the width.
    pub fn to_dense(&self, max_len: Option<usize>) -> Tensor {
        let width = max_len.unwrap_or_else(|| self.max_row_length());
        let mut dense = Array2::<f32>::zeros((self.batch_size(), width));

        for (i, row) in self.rows().enumerate() {
            for (j, &value) in row.iter().take(width).enumerate() {
                dense[[i, j]] = value;
            }
        }

        dense.into_dyn().into_shared()
    }

    /// Convert to a COO sparse tensor
    pub fn to_sparse(&self) -> SparseTensor {
        let mut indices = Vec::with_capacity(self.values.len());
        for (i, &len) in self.row_lengths.iter().enumerate() {
            indices.extend((0..len).map(|j| [i, j]));
        }

        SparseTensor {
            indices,
            values: self.values.clone(),
            dense_shape: [self.batch_size(), self.max_row_length()],
        }
    }
}

impl fmt::Debug for RaggedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RaggedTensor{{ rows: {}, nnz: {} }}",
            self.batch_size(),
            self.values.len()
        )
    }
}

/// A 2-D sparse tensor in coordinate (COO) format
#[derive(Clone, PartialEq)]
pub struct SparseTensor {
    indices: Vec<[usize; 2]>,
    values: Vec<f32>,
    dense_shape: [usize; 2],
}

impl SparseTensor {
    /// Create a COO sparse tensor from values and `[row, col]` indices
    pub fn from_coo(indices: Vec<[usize; 2]>, values: Vec<f32>, dense_shape: [usize; 2]) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(Error::InvalidArgument(
                "Indices length must match values length".into(),
            ));
        }

        if indices
            .iter()
            .any(|&[row, col]| row >= dense_shape[0] || col >= dense_shape[1])
        {
            return Err(Error::ShapeInconsistency(format!(
                "sparse index out of bounds for shape {dense_shape:?}"
            )));
        }

        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    /// Number of stored values
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Coordinates of the stored values
    pub fn indices(&self) -> &[[usize; 2]] {
        &self.indices
    }

    /// Stored values
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Shape of the equivalent dense tensor
    pub fn dense_shape(&self) -> [usize; 2] {
        self.dense_shape
    }

    /// Materialise as a dense tensor
    pub fn to_dense(&self) -> Tensor {
        let mut dense = Array2::<f32>::zeros((self.dense_shape[0], self.dense_shape[1]));
        for (&[row, col], &value) in self.indices.iter().zip(&self.values) {
            dense[[row, col]] = value;
        }

        dense.into_dyn().into_shared()
    }
}

impl fmt::Debug for SparseTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SparseTensor{{ shape: {:?}, nnz: {} }}",
            self.dense_shape,
            self.nnz()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_keeps_batch_dimension() {
        let t = tensor_from_vec((0..24).map(|v| v as f32).collect(), &[2, 3, 4]).unwrap();
        let flat = flatten_2d(&t).unwrap();
        assert_eq!(flat.shape(), &[2, 12]);
        assert_eq!(flat[[1, 0]], 12.0);

        let rank1 = tensor_from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        assert_eq!(flatten_2d(&rank1).unwrap().shape(), &[3, 1]);
    }

    #[test]
    fn test_ragged_rejects_mismatched_lengths() {
        assert!(RaggedTensor::new(vec![1.0, 2.0], vec![1, 2]).is_err());
    }

    #[test]
    fn test_ragged_to_dense_pads_and_truncates() {
        let ragged = RaggedTensor::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0]]);

        let padded = ragged.to_dense(None);
        assert_eq!(padded.shape(), &[2, 3]);
        assert_eq!(padded[[1, 0]], 4.0);
        assert_eq!(padded[[1, 2]], 0.0);

        let truncated = ragged.to_dense(Some(2));
        assert_eq!(truncated.shape(), &[2, 2]);
        assert_eq!(truncated[[0, 1]], 2.0);
    }

    #[test]
    fn test_ragged_to_sparse_round_trips_through_dense() {
        let ragged = RaggedTensor::from_rows(&[vec![5.0], vec![], vec![6.0, 7.0]]);
        let sparse = ragged.to_sparse();

        assert_eq!(sparse.nnz(), 3);
        assert_eq!(sparse.dense_shape(), [3, 2]);
        assert_eq!(sparse.to_dense(), ragged.to_dense(None));
    }
}
