use indicatif::ParallelProgressIterator;
use log::{debug, info};
use ndarray::ArrayView2;
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;

use crate::config::{MAX_SUB_CENTROIDS, TrainConfig};
use crate::distance::{l2sqr, nearest};
use crate::error::{PqkError, Result};
use crate::utils::{flat, progress_bar, seeded_rng};

/// 乘积量化码本
///
/// 共 M 个子空间，每个子空间 K 个宽度为 Ds 的子聚类中心，
/// 按 [M][K][Ds] 的顺序展平存储。训练完成后不再修改。
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    m: usize,
    k: usize,
    ds: usize,
    centroids: Vec<f32>,
}

impl Codebook {
    pub fn from_parts(m: usize, k: usize, ds: usize, centroids: Vec<f32>) -> Result<Self> {
        if m == 0 || ds == 0 {
            return Err(PqkError::InvalidDimension { dim: m * ds, m });
        }
        if k == 0 || k > MAX_SUB_CENTROIDS {
            return Err(PqkError::InvalidParameter(format!("K 必须在 1 ~ {MAX_SUB_CENTROIDS} 之间，实际为 {k}")));
        }
        if centroids.len() != m * k * ds {
            return Err(PqkError::DimensionMismatch { expected: m * k * ds, actual: centroids.len() });
        }
        Ok(Self { m, k, ds, centroids })
    }

    /// 子空间数量
    pub fn m(&self) -> usize {
        self.m
    }

    /// 每个子空间的子聚类中心数量
    pub fn k(&self) -> usize {
        self.k
    }

    /// 子空间宽度
    pub fn ds(&self) -> usize {
        self.ds
    }

    /// 原始向量维度
    pub fn dim(&self) -> usize {
        self.m * self.ds
    }

    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// 子空间 m 的全部子聚类中心，长度为 K * Ds
    #[inline]
    pub fn subspace(&self, m: usize) -> &[f32] {
        let size = self.k * self.ds;
        &self.centroids[m * size..(m + 1) * size]
    }

    #[inline]
    pub fn centroid(&self, m: usize, k: usize) -> &[f32] {
        let offset = (m * self.k + k) * self.ds;
        &self.centroids[offset..offset + self.ds]
    }

    /// 检查单个编码的长度和取值
    pub fn check_code(&self, code: &[u8]) -> Result<()> {
        self.check_codes(code, code.len())
    }

    /// 检查展平的编码数组，width 为每个编码的长度
    pub(crate) fn check_codes(&self, codes: &[u8], width: usize) -> Result<()> {
        validate_codes(codes, width, self.m, self.k)
    }
}

/// 检查编码长度是否为 m，且每个子索引都小于 k
pub(crate) fn validate_codes(codes: &[u8], width: usize, m: usize, k: usize) -> Result<()> {
    if width != m {
        return Err(PqkError::DimensionMismatch { expected: m, actual: width });
    }
    if k >= MAX_SUB_CENTROIDS {
        return Ok(());
    }
    match codes.par_iter().position_first(|&v| v as usize >= k) {
        Some(pos) => Err(PqkError::CodeOutOfRange {
            index: pos / m,
            subspace: pos % m,
            value: codes[pos],
            k,
        }),
        None => Ok(()),
    }
}

/// 训练码本：对每个子空间独立进行 kmeans 聚类
///
/// 参数：
/// - vectors: N×D 的训练向量
/// - config: 训练参数，D 必须能被 M 整除，且训练向量数量不少于 K
pub fn train_codebook(vectors: ArrayView2<'_, f32>, config: &TrainConfig) -> Result<Codebook> {
    let dim = vectors.ncols();
    let ds = config.validate(dim)?;
    let (m, k) = (config.m, config.k);

    let x = vectors.as_standard_layout();
    let x = flat(&x)?;
    let n = vectors.nrows();

    let mut rng = seeded_rng(config.seed);
    let rows: Vec<usize> = match config.training_samples {
        Some(s) if s < n => {
            let mut rows = index::sample(&mut rng, n, s).into_vec();
            rows.sort_unstable();
            rows
        }
        _ => (0..n).collect(),
    };

    // 所有子空间共用同一批训练行，数量不足时每个子空间都不足，只报告第一个
    if rows.len() < k {
        return Err(PqkError::InsufficientTrainingData { subspace: 0, required: k, actual: rows.len() });
    }

    info!("使用 {} 个向量训练码本，M = {m}，K = {k}，子空间宽度 = {ds}", rows.len());

    let pb = progress_bar(m, config.verbose);
    let parts = (0..m)
        .into_par_iter()
        .progress_with(pb.clone())
        .map(|sub| {
            let slices: Vec<f32> = rows
                .iter()
                .flat_map(|&r| &x[r * dim + sub * ds..r * dim + (sub + 1) * ds])
                .copied()
                .collect();
            let mut rng = seeded_rng(config.seed.map(|s| s.wrapping_add(sub as u64)));
            let (centroids, iterations) =
                train_subspace(&slices, ds, k, config.max_iter, config.tolerance, &mut rng);
            debug!("子空间 {sub} 训练完成，迭代 {iterations} 轮");
            centroids
        })
        .collect::<Vec<_>>();
    pb.finish_with_message("码本训练完成");

    Codebook::from_parts(m, k, ds, parts.concat())
}

/// 单个子空间上的 Lloyd kmeans，返回 K 个子聚类中心和实际迭代轮数
///
/// 初始中心为不放回随机选取的 K 个训练向量。
/// 没有分配到向量的中心会被重置为当前离所属中心最远的训练向量。
fn train_subspace<R: Rng>(
    x: &[f32],
    ds: usize,
    k: usize,
    max_iter: usize,
    tolerance: f32,
    rng: &mut R,
) -> (Vec<f32>, usize) {
    let n = x.len() / ds;

    let mut centroids = Vec::with_capacity(k * ds);
    for i in index::sample(rng, n, k) {
        centroids.extend_from_slice(&x[i * ds..(i + 1) * ds]);
    }

    for iter in 0..max_iter {
        let (assignments, mut distances): (Vec<usize>, Vec<f32>) =
            x.par_chunks_exact(ds).map(|xi| nearest(xi, &centroids, ds)).unzip();

        let mut sums = vec![0f64; k * ds];
        let mut counts = vec![0usize; k];
        for (xi, &c) in x.chunks_exact(ds).zip(&assignments) {
            counts[c] += 1;
            for (s, &v) in sums[c * ds..(c + 1) * ds].iter_mut().zip(xi) {
                *s += v as f64;
            }
        }

        let mut new_centroids = vec![0f32; k * ds];
        for c in 0..k {
            let dst = &mut new_centroids[c * ds..(c + 1) * ds];
            if counts[c] > 0 {
                let cnt = counts[c] as f64;
                for (d, s) in dst.iter_mut().zip(&sums[c * ds..(c + 1) * ds]) {
                    *d = (*s / cnt) as f32;
                }
            } else {
                // 同一个向量不会被用来重置两个中心
                let (far, _) = distances
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |acc, (i, &d)| if d > acc.1 { (i, d) } else { acc });
                distances[far] = f32::NEG_INFINITY;
                dst.copy_from_slice(&x[far * ds..(far + 1) * ds]);
            }
        }

        let shift = centroids
            .chunks_exact(ds)
            .zip(new_centroids.chunks_exact(ds))
            .map(|(a, b)| l2sqr(a, b))
            .fold(0.0f32, f32::max);
        centroids = new_centroids;

        if shift <= tolerance {
            return (centroids, iter + 1);
        }
    }

    (centroids, max_iter)
}
