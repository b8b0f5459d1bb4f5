//! Exact cosine distance between embedding vectors.
//!
//! Distances are reported on the `[0, 1]` scale used by downstream
//! thresholds: `0` for identical direction, `1` for opposite direction.

pub mod device;

pub use device::{Accelerator, DeviceMatrix};

/// Map a cosine similarity in `[-1, 1]` to a distance in `[0, 1]`.
#[must_use]
pub fn normalize_cosine_distance(cosine: f32) -> f32 {
    ((cosine - 1.0) / -2.0).clamp(0.0, 1.0)
}

/// Cosine similarity from a dot product and the two squared norms.
///
/// A zero-norm operand has no direction; its similarity to anything is `0`.
#[must_use]
pub fn cosine_from_parts(dot: f32, left_sq_norm: f32, right_sq_norm: f32) -> f32 {
    let denominator = (f64::from(left_sq_norm) * f64::from(right_sq_norm)).sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    ((f64::from(dot) / denominator) as f32).clamp(-1.0, 1.0)
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine distance between two vectors of equal length.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let cosine = cosine_from_parts(dot_product(a, b), dot_product(a, a), dot_product(b, b));
    normalize_cosine_distance(cosine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_bounds() {
        assert_eq!(normalize_cosine_distance(1.0), 0.0);
        assert_eq!(normalize_cosine_distance(-1.0), 1.0);
        assert!((normalize_cosine_distance(0.0) - 0.5).abs() < 1e-6);
        // Rounding noise outside [-1, 1] stays in range.
        assert_eq!(normalize_cosine_distance(1.000_001), 0.0);
        assert_eq!(normalize_cosine_distance(-1.000_001), 1.0);
    }

    #[test]
    fn test_self_distance_is_zero() {
        let vectors: [&[f32]; 3] = [&[1.0, 2.0, 3.0], &[0.3, -0.7, 0.11, 5.0], &[1e-3, 4e3]];
        for v in vectors {
            assert_eq!(cosine_distance(v, v), 0.0, "{v:?}");
        }
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_has_no_direction() {
        assert!((cosine_distance(&[0.0, 0.0], &[1.0, 0.0]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_scale_invariance() {
        let a = [0.2, 0.4, -0.1];
        let b = [0.5, 0.1, 0.3];
        let scaled: Vec<f32> = b.iter().map(|x| x * 10.0).collect();
        assert!((cosine_distance(&a, &b) - cosine_distance(&a, &scaled)).abs() < 1e-6);
    }
}
