//! Batched distance evaluation on a candle device.

use eyre::WrapErr as _;

/// Compute device used for batched distance evaluation.
#[derive(Debug, Clone)]
pub struct Accelerator {
    device: candle_core::Device,
}

impl Accelerator {
    /// The best available device: CUDA or Metal when compiled in, CPU otherwise.
    pub fn new() -> eyre::Result<Self> {
        #[cfg(feature = "cuda")]
        let device = candle_core::Device::new_cuda(0).wrap_err("failed to create CUDA device")?;

        #[cfg(all(feature = "metal", not(feature = "cuda")))]
        let device = candle_core::Device::new_metal(0).wrap_err("failed to create Metal device")?;

        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        let device = candle_core::Device::Cpu;

        tracing::info!(?device, "distance evaluation device selected");
        Ok(Self { device })
    }

    #[must_use]
    pub fn cpu() -> Self {
        Self {
            device: candle_core::Device::Cpu,
        }
    }

    #[must_use]
    pub fn device(&self) -> &candle_core::Device {
        &self.device
    }

    /// Copy a dense `(rows, dimension)` matrix to the device.
    pub fn upload(&self, vectors: vecmatch_core::EmbeddingView<'_>) -> eyre::Result<DeviceMatrix> {
        let (rows, dimension) = vectors.dim();
        let tensor = match vectors.as_slice() {
            Some(slice) => candle_core::Tensor::from_slice(slice, (rows, dimension), &self.device),
            None => {
                let owned: Vec<f32> = vectors.iter().copied().collect();
                candle_core::Tensor::from_vec(owned, (rows, dimension), &self.device)
            }
        }
        .wrap_err("failed to upload vectors")?;
        Ok(DeviceMatrix {
            tensor,
            rows,
            device: self.device.clone(),
        })
    }
}

impl Default for Accelerator {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::cpu())
    }
}

/// A vector matrix resident on an [`Accelerator`].
#[derive(Debug)]
pub struct DeviceMatrix {
    tensor: candle_core::Tensor,
    rows: usize,
    device: candle_core::Device,
}

impl DeviceMatrix {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Cosine distance between `left[k]` and `right[k]` for every k.
    ///
    /// Indices address rows of the matrix. Dot products and squared norms are
    /// reduced on the device; the final division runs on the host so that a
    /// vector compared with itself yields exactly `0`.
    pub fn pairwise_distances(&self, left: &[u32], right: &[u32]) -> eyre::Result<Vec<f32>> {
        if left.len() != right.len() {
            eyre::bail!(
                "pair index length mismatch: {} left, {} right",
                left.len(),
                right.len()
            );
        }
        if left.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(&bad) = left.iter().chain(right).find(|&&i| i as usize >= self.rows) {
            eyre::bail!("pair index {bad} out of range for {} rows", self.rows);
        }

        let left_idx = candle_core::Tensor::from_slice(left, left.len(), &self.device)?;
        let right_idx = candle_core::Tensor::from_slice(right, right.len(), &self.device)?;
        let lhs = self
            .tensor
            .index_select(&left_idx, 0)
            .wrap_err("failed to gather left vectors")?;
        let rhs = self
            .tensor
            .index_select(&right_idx, 0)
            .wrap_err("failed to gather right vectors")?;

        let dots = lhs.mul(&rhs)?.sum(1)?.to_vec1::<f32>()?;
        let left_norms = lhs.sqr()?.sum(1)?.to_vec1::<f32>()?;
        let right_norms = rhs.sqr()?.sum(1)?.to_vec1::<f32>()?;

        Ok(dots
            .iter()
            .zip(left_norms.iter().zip(&right_norms))
            .map(|(&dot, (&nl, &nr))| {
                crate::normalize_cosine_distance(crate::cosine_from_parts(dot, nl, nr))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_pairwise_matches_scalar() {
        let vectors = array![[1.0_f32, 0.0, 0.0], [0.6, 0.8, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let matrix = Accelerator::cpu().upload(vectors.view()).unwrap();

        let left: [u32; 5] = [0, 0, 0, 1, 3];
        let right: [u32; 5] = [0, 1, 2, 1, 0];
        let distances = matrix.pairwise_distances(&left, &right).unwrap();

        for (k, distance) in distances.iter().enumerate() {
            let a = vectors.row(left[k] as usize).to_vec();
            let b = vectors.row(right[k] as usize).to_vec();
            let expected = crate::cosine_distance(&a, &b);
            assert!((distance - expected).abs() < 1e-6, "pair {k}: {distance} vs {expected}");
        }
        assert_eq!(distances[0], 0.0);
        assert_eq!(distances[3], 0.0);
        assert!((distances[2] - 1.0).abs() < 1e-6);
        assert!((distances[4] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_indices() {
        let vectors = array![[1.0_f32, 0.0]];
        let matrix = Accelerator::cpu().upload(vectors.view()).unwrap();
        assert!(matrix.pairwise_distances(&[0], &[1]).is_err());
        assert!(matrix.pairwise_distances(&[0, 0], &[0]).is_err());
        assert!(matrix.pairwise_distances(&[], &[]).unwrap().is_empty());
    }
}
