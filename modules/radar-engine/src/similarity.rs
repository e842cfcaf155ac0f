//! Vector helpers shared by the clusterer and the session registry.

/// Cosine similarity for f32 embedding vectors. Zero vectors are dissimilar to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// `1 - cosine_similarity`, in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

/// Fold `point` into a running mean that currently averages `count` points.
pub fn update_centroid(centroid: &mut [f32], point: &[f32], count: usize) {
    let n = count as f32;
    for (c, p) in centroid.iter_mut().zip(point.iter()) {
        *c = (*c * n + *p) / (n + 1.0);
    }
}

/// Plain mean of a set of vectors.
pub fn mean_vector<'a>(vectors: impl IntoIterator<Item = &'a [f32]>, dimension: usize) -> Vec<f32> {
    let mut sum = vec![0.0f32; dimension];
    let mut n = 0usize;
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        n += 1;
    }
    if n > 0 {
        for s in &mut sum {
            *s /= n as f32;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_similarity_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
        assert!(cosine_distance(&v, &v).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_similarity_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn opposite_vectors_distance_is_two() {
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_norm_returns_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn running_mean_matches_batch_mean() {
        let points: [&[f32]; 3] = [&[1.0, 0.0], &[0.0, 1.0], &[2.0, 2.0]];
        let mut centroid = points[0].to_vec();
        for (i, p) in points.iter().enumerate().skip(1) {
            update_centroid(&mut centroid, p, i);
        }
        let batch = mean_vector(points, 2);
        assert!((centroid[0] - batch[0]).abs() < 1e-6);
        assert!((centroid[1] - batch[1]).abs() < 1e-6);
        assert_eq!(batch, vec![1.0, 1.0]);
    }
}
