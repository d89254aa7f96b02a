use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array2, Axis, array, concatenate};
use pqkmeans::*;
use rand::prelude::*;
use rstest::*;

/// 12 个均匀分布之和近似标准正态分布
fn noise<R: Rng>(rng: &mut R) -> f32 {
    (0..12).map(|_| rng.random::<f32>()).sum::<f32>() - 6.0
}

#[fixture]
fn logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[fixture]
fn toy() -> Array2<f32> {
    array![[0.0f32, 0.0], [0.0, 1.0], [10.0, 10.0], [10.0, 11.0]]
}

/// 4 个相距很远的高斯团，D = 16
#[fixture]
fn blobs() -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(42);
    let centers: Vec<Vec<f32>> =
        (0..4).map(|_| (0..16).map(|_| rng.random_range(-100.0..100.0)).collect()).collect();
    Array2::from_shape_fn((2000, 16), |(i, j)| centers[i % 4][j] + noise(&mut rng))
}

#[fixture]
fn blob_codes(blobs: Array2<f32>) -> (Codebook, Array2<u8>) {
    let cb = train_codebook(blobs.view(), &TrainConfig::new(4, 16).with_seed(7)).unwrap();
    let codes = encode_batch(blobs.view(), &cb).unwrap();
    (cb, codes)
}

#[rstest]
fn test_end_to_end_toy(
    #[from(logger)] _logger: (),
    toy: Array2<f32>,
    #[values(0, 1, 2, 42, 1234)] seed: u64,
) -> anyhow::Result<()> {
    let cb = Arc::new(train_codebook(toy.view(), &TrainConfig::new(2, 2).with_seed(seed))?);
    let codes = encode_batch(toy.view(), &cb)?;
    let table = Arc::new(build_distance_table(&cb));

    let r = fit(codes.view(), table.clone(), 2, 20, 1e-4, seed)?;
    let a = &r.assignments;
    assert_eq!(a[0], a[1]);
    assert_eq!(a[2], a[3]);
    assert_ne!(a[0], a[2]);
    assert_eq!(r.distsum, 0.0);
    assert_eq!(r.centroid_frequency, vec![2, 2]);
    assert!(r.converged());
    assert!(r.iterations <= 3, "iterations = {}", r.iterations);

    let model = PqKMeansModel::from_fit(cb, table, &r)?;
    let decoded = model.decoded_centroids()?;
    let (low, high) = (decoded.row(a[0]), decoded.row(a[2]));
    assert!((low[0] - 0.0).abs() < 1e-6 && (low[1] - 0.5).abs() < 1e-6);
    assert!((high[0] - 10.0).abs() < 1e-6 && (high[1] - 10.5).abs() < 1e-6);
    Ok(())
}

#[rstest]
fn test_end_to_end_toy_seed_0(toy: Array2<f32>) -> anyhow::Result<()> {
    let cb = Arc::new(train_codebook(toy.view(), &TrainConfig::new(2, 2).with_seed(0))?);
    let codes = encode_batch(toy.view(), &cb)?;
    let table = Arc::new(build_distance_table(&cb));

    let r = fit(codes.view(), table.clone(), 2, 20, 1e-4, 0)?;
    assert_eq!(r.assignments, vec![0, 0, 1, 1]);
    assert!(r.converged());
    assert!(r.iterations <= 3, "iterations = {}", r.iterations);

    let decoded = PqKMeansModel::from_fit(cb, table, &r)?.decoded_centroids()?;
    assert!((decoded[[0, 0]] - 0.0).abs() < 1e-6 && (decoded[[0, 1]] - 0.5).abs() < 1e-6);
    assert!((decoded[[1, 0]] - 10.0).abs() < 1e-6 && (decoded[[1, 1]] - 10.5).abs() < 1e-6);
    Ok(())
}

#[rstest]
fn test_codes_in_range(blob_codes: (Codebook, Array2<u8>)) {
    let (cb, codes) = blob_codes;
    assert_eq!(codes.dim(), (2000, 4));
    assert!(codes.iter().all(|&c| (c as usize) < cb.k()));
}

#[rstest]
fn test_encode_chunks_matches_batch(
    blobs: Array2<f32>,
    blob_codes: (Codebook, Array2<u8>),
) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let chunks = encode_chunks(blobs.view(), &cb, 300)?.collect::<Result<Vec<_>>>()?;
    assert_eq!(chunks.len(), 7);
    let views = chunks.iter().map(|c| c.view()).collect::<Vec<_>>();
    assert_eq!(concatenate(Axis(0), &views)?, codes);
    Ok(())
}

#[rstest]
fn test_fit_result_consistency(
    #[from(logger)] _logger: (),
    blob_codes: (Codebook, Array2<u8>),
    #[values(InitMethod::Random, InitMethod::PlusPlus)] init: InitMethod,
) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let table = Arc::new(build_distance_table(&cb));
    let conf = FitConfig::new(8).with_seed(3).with_init(init).verbose(true);
    let r = PqKMeans::new(table.clone(), conf).fit(codes.view())?;

    assert_eq!(r.assignments.len(), 2000);
    assert_eq!(r.centroids.dim(), (8, 4));
    assert!(r.centroid_frequency.iter().all(|&c| c > 0));
    assert_eq!(r.centroid_frequency.iter().sum::<usize>(), 2000);

    // 返回的距离和与分配结果一致
    let expected: f64 = codes
        .rows()
        .into_iter()
        .zip(&r.assignments)
        .map(|(code, &c)| table.distance(code.as_slice().unwrap(), r.centroids.row(c).as_slice().unwrap()) as f64)
        .sum();
    assert!((expected - r.distsum).abs() <= 1e-3 * expected.max(1.0));

    // 重新分配到最近中心不会使距离和变大
    let (_, best) = assign(codes.view(), r.centroids.view(), &table)?;
    assert!(best <= r.distsum + 1e-3 * best.max(1.0));
    Ok(())
}

#[rstest]
fn test_fit_is_deterministic(blob_codes: (Codebook, Array2<u8>)) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let table = Arc::new(build_distance_table(&cb));
    let km = PqKMeans::new(table, FitConfig::new(6).with_seed(11).with_init(InitMethod::PlusPlus));
    let a = km.fit(codes.view())?;
    let b = km.fit(codes.view())?;
    assert_eq!(a.assignments, b.assignments);
    assert_eq!(a.centroids, b.centroids);
    assert_eq!(a.iterations, b.iterations);
    Ok(())
}

#[rstest]
fn test_cancel_from_callback(blob_codes: (Codebook, Array2<u8>)) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let table = Arc::new(build_distance_table(&cb));
    let token = CancelToken::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let (t, c) = (token.clone(), calls.clone());
    let r = PqKMeans::new(table, FitConfig::new(16).with_seed(5).with_epsilon(0.0).with_max_iter(100))
        .with_cancel_token(token)
        .on_iteration(move |stats| {
            assert_eq!(stats.iteration, c.fetch_add(1, Ordering::SeqCst) + 1);
            t.cancel();
        })
        .fit(codes.view())?;

    assert_eq!(r.iterations, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(r.converged() || r.termination == Termination::Cancelled);
    // 提前结束时仍然返回完整的结果
    assert_eq!(r.assignments.len(), 2000);
    assert!(r.centroid_frequency.iter().all(|&c| c > 0));
    Ok(())
}

#[rstest]
fn test_fit_2level(#[from(logger)] _logger: (), blob_codes: (Codebook, Array2<u8>)) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let table = Arc::new(build_distance_table(&cb));
    let r = PqKMeans::new(table.clone(), FitConfig::new(20).with_seed(1)).fit_2level(codes.view())?;
    assert_eq!(r.centroids.dim(), (20, 4));
    assert!(r.centroid_frequency.iter().all(|&c| c > 0));

    let (assignments, distsum) = assign(codes.view(), r.centroids.view(), &table)?;
    assert!(distsum <= r.distsum + 1e-3 * distsum.max(1.0));
    assert_eq!(assignments.len(), 2000);
    Ok(())
}

#[rstest]
fn test_predict_matches_encode(blobs: Array2<f32>, blob_codes: (Codebook, Array2<u8>)) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let cb = Arc::new(cb);
    let table = Arc::new(build_distance_table(&cb));
    let r = PqKMeans::new(table.clone(), FitConfig::new(4).with_seed(2)).fit(codes.view())?;
    let model = PqKMeansModel::from_fit(cb.clone(), table.clone(), &r)?;

    let by_vector = model.predict_vectors(blobs.view(), DistanceStrategy::Symmetric)?;
    let by_code = model.predict_batch(codes.view())?;
    assert_eq!(by_vector, by_code);

    for (i, row) in blobs.rows().into_iter().enumerate().step_by(97) {
        let v = row.as_slice().unwrap();
        let code = encode(v, &cb)?;
        assert_eq!(model.predict(&code)?, by_code[i]);
        assert_eq!(predict(&code, model.centroids(), &table)?, by_code[i]);
        assert_eq!(model.predict_vector(v, DistanceStrategy::Symmetric)?, by_code[i]);
    }

    // 非对称距离与对称距离结果不一定完全相同，但数量一致
    let asym = model.predict_vectors(blobs.view(), DistanceStrategy::Asymmetric)?;
    assert_eq!(asym.len(), 2000);
    assert!(asym.iter().all(|&c| c < 4));
    Ok(())
}

#[rstest]
fn test_reconstruction_error_is_small(
    blobs: Array2<f32>,
    blob_codes: (Codebook, Array2<u8>),
) -> anyhow::Result<()> {
    let (cb, codes) = blob_codes;
    let err = reconstruction_error(blobs.view(), codes.view(), &cb)?;
    let var = blobs.var_axis(Axis(0), 0.0).sum();
    assert!(err < var * 0.1, "err = {err}, var = {var}");
    Ok(())
}

#[rstest]
fn test_invalid_inputs(blob_codes: (Codebook, Array2<u8>)) {
    let (cb, codes) = blob_codes;
    let table = Arc::new(build_distance_table(&cb));

    let wide = Array2::<u8>::zeros((10, 5));
    assert!(matches!(
        fit(wide.view(), table.clone(), 2, 10, 1e-4, 0),
        Err(PqkError::DimensionMismatch { expected: 4, actual: 5 })
    ));
    assert!(matches!(
        fit(codes.slice(ndarray::s![..3, ..]).view(), table.clone(), 4, 10, 1e-4, 0),
        Err(PqkError::InvalidParameter(_))
    ));
    let mut bad = codes.clone();
    bad[[5, 2]] = 16;
    assert!(matches!(
        fit(bad.view(), table, 2, 10, 1e-4, 0),
        Err(PqkError::CodeOutOfRange { index: 5, subspace: 2, value: 16, k: 16 })
    ));
}
