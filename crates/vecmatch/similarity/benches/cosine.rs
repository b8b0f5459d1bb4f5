//! Benchmarks for cosine distance.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn vector(seed: usize, dim: usize) -> Vec<f32> {
    (0..dim).map(|j| ((seed * dim + j) as f32).sin()).collect()
}

fn bench_cosine(c: &mut Criterion) {
    let a = vector(1, 1024);
    let b = vector(2, 1024);

    c.bench_function("cosine_distance_dim1024", |bench| {
        bench.iter(|| vecmatch_similarity::cosine_distance(black_box(&a), black_box(&b)))
    });

    let rows = 512;
    let flat: Vec<f32> = (0..rows).flat_map(|i| vector(i, 1024)).collect();
    let matrix = ndarray::Array2::from_shape_vec((rows, 1024), flat).unwrap();
    let device = vecmatch_similarity::Accelerator::cpu()
        .upload(matrix.view())
        .unwrap();
    let left: Vec<u32> = (0..4096).map(|k| (k % rows) as u32).collect();
    let right: Vec<u32> = (0..4096).map(|k| ((k * 7) % rows) as u32).collect();

    c.bench_function("pairwise_4096_pairs_dim1024", |bench| {
        bench.iter(|| device.pairwise_distances(black_box(&left), black_box(&right)).unwrap())
    });
}

criterion_group!(benches, bench_cosine);
criterion_main!(benches);
