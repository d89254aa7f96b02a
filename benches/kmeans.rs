use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use pqkmeans::{FitConfig, PqKMeans, TrainConfig, assign, build_distance_table, encode_batch, train_codebook};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// 生成有聚类模式的测试数据
fn generate_clustered_data(n: usize, d: usize, num_clusters: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(42); // 使用固定种子确保结果可重现
    let centers: Vec<Vec<f32>> = (0..num_clusters)
        .map(|_| (0..d).map(|_| rng.random_range(-50.0..50.0)).collect())
        .collect();
    Array2::from_shape_fn((n, d), |(i, j)| centers[i % num_clusters][j] + rng.random_range(-1.0..1.0))
}

// 固定 M，增加 D：分配的耗时只与 N·Kc·M 有关
fn bench_assign_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_fixed_m");
    let (n, m, k, kc) = (20000, 8, 64, 256);

    for d in [32, 128, 512] {
        let x = generate_clustered_data(n, d, 64);
        let conf = TrainConfig::new(m, k).with_seed(1).with_training_samples(4096);
        let cb = train_codebook(x.view(), &conf).unwrap();
        let codes = encode_batch(x.view(), &cb).unwrap();
        let table = build_distance_table(&cb);
        let centroids = codes.slice(ndarray::s![..kc, ..]).to_owned();

        group.bench_with_input(BenchmarkId::from_parameter(d), &d, |b, _| {
            b.iter(|| assign(black_box(codes.view()), centroids.view(), &table).unwrap())
        });
    }

    group.finish();
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("pqkmeans_fit");
    group.sample_size(10);

    let x = generate_clustered_data(30720, 64, 512);
    let conf = TrainConfig::new(8, 256).with_seed(1).with_training_samples(8192);
    let cb = train_codebook(x.view(), &conf).unwrap();
    let codes = encode_batch(x.view(), &cb).unwrap();
    let table = Arc::new(build_distance_table(&cb));

    for kc in [256, 1024] {
        let km = PqKMeans::new(table.clone(), FitConfig::new(kc).with_seed(7).with_max_iter(10));
        group.bench_function(format!("fit_{kc}"), |b| {
            b.iter(|| km.fit(black_box(codes.view())).unwrap())
        });
        group.bench_function(format!("fit_2level_{kc}"), |b| {
            b.iter(|| km.fit_2level(black_box(codes.view())).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_assign_scaling, bench_fit);
criterion_main!(benches);
