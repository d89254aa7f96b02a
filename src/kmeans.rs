//! 直接在 PQ 编码上进行的 kmeans 聚类（PQk-means）
//!
//! 数据点和聚类中心都是编码，所有距离都通过 [`DistanceTable`] 查表得到。
//! 编码无法求平均，因此更新步骤改为：对每个聚类的每个子空间，统计成员子索引的直方图，
//! 再在 K 个候选子索引中找出到所有成员距离之和最小的一个。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressIterator};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;

use crate::codebook::validate_codes;
use crate::config::{FitConfig, InitMethod};
use crate::distance::DistanceTable;
use crate::error::{FitWarning, PqkError, Result};
use crate::utils::{flat, imbalance_factor, progress_bar, seeded_rng};

/// 聚类过程所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPhase {
    Initialized,
    Assigning,
    Updating,
    ConvergenceCheck,
    Terminated,
}

/// 聚类结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// 分配结果不再变化，或总距离的相对改善小于 epsilon
    Converged,
    /// 达到最大迭代次数
    MaxIterations,
    /// 外部通过 [`CancelToken`] 取消
    Cancelled,
    /// 超出时间预算
    TimeLimit,
}

/// 用于在两轮迭代之间取消聚类
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// 每一轮迭代结束后传给回调的信息
#[derive(Debug, Clone, Copy)]
pub struct IterationStats<'a> {
    pub iteration: usize,
    /// 所有编码到所属聚类中心的距离之和
    pub distsum: f64,
    /// 与上一轮相比距离和的变化
    pub delta: f64,
    /// 分配结果发生变化的编码数量
    pub changed: usize,
    pub centroid_frequency: &'a [usize],
}

pub type IterationCallback = Box<dyn Fn(&IterationStats<'_>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FitResult {
    /// 每个编码所属的聚类序号
    pub assignments: Vec<usize>,
    /// Kc×M 的聚类中心编码
    pub centroids: Array2<u8>,
    /// 所有编码到所属聚类中心的距离之和
    pub distsum: f64,
    pub iterations: usize,
    pub termination: Termination,
    /// 每个聚类中心包含的编码数量
    pub centroid_frequency: Vec<usize>,
    pub warnings: Vec<FitWarning>,
}

impl FitResult {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }

    /// 是否被取消或超时提前结束
    pub fn interrupted(&self) -> bool {
        matches!(self.termination, Termination::Cancelled | Termination::TimeLimit)
    }

    pub fn imbalance(&self) -> f64 {
        imbalance_factor(&self.centroid_frequency)
    }
}

/// 一次聚类中不随迭代改变的上下文：距离表、参数、取消信号和回调
pub struct PqKMeans {
    table: Arc<DistanceTable>,
    config: FitConfig,
    cancel: Option<CancelToken>,
    callback: Option<IterationCallback>,
}

impl PqKMeans {
    pub fn new(table: Arc<DistanceTable>, config: FitConfig) -> Self {
        Self { table, config, cancel: None, callback: None }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 设置每轮迭代结束后的回调
    pub fn on_iteration<F>(mut self, f: F) -> Self
    where
        F: Fn(&IterationStats<'_>) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn table(&self) -> &Arc<DistanceTable> {
        &self.table
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// 对 N×M 的编码矩阵进行聚类
    pub fn fit(&self, codes: ArrayView2<'_, u8>) -> Result<FitResult> {
        let x = codes.as_standard_layout();
        let x = flat(&x)?;
        self.validate(x, codes.ncols(), self.config.kc)?;
        let pb = progress_bar(self.config.max_iter, self.config.verbose);
        self.lloyd(x, self.config.kc, self.config.seed, Instant::now(), &pb)
    }

    /// 聚类并只返回分配结果
    pub fn fit_predict(&self, codes: ArrayView2<'_, u8>) -> Result<Vec<usize>> {
        Ok(self.fit(codes)?.assignments)
    }

    /// 两级聚类，损失少许精度大幅提高 Kc 很大时的速度
    ///
    /// 先取 sqrt(Kc) 个中心做一级聚类，再按一级聚类的大小加权分配二级中心数量，
    /// 在每个一级聚类内部分别聚类，最后用全部中心重新分配一次。
    pub fn fit_2level(&self, codes: ArrayView2<'_, u8>) -> Result<FitResult> {
        let x = codes.as_standard_layout();
        let x = flat(&x)?;
        let kc = self.config.kc;
        self.validate(x, codes.ncols(), kc)?;

        let start = Instant::now();
        let m = self.table.m();
        let n = x.len() / m;
        let nc1 = kc.isqrt();
        let mut rng = seeded_rng(self.config.seed);

        // 没有必要用全部编码进行一级聚类，这里取 nc1 的 1024 倍来训练，平衡精度和耗时
        let n1 = (nc1 * 1024).min(n);
        let mut rows = index::sample(&mut rng, n, n1).into_vec();
        rows.sort_unstable();
        let x1: Vec<u8> = rows.iter().flat_map(|&r| &x[r * m..(r + 1) * m]).copied().collect();
        info!("对 {n1} 个编码进行 1 级聚类，中心点数量 = {nc1}");
        let level1 = self.lloyd(&x1, nc1, self.config.seed, start, &ProgressBar::hidden())?;
        info!("1 级聚类完成，不平衡度：{:.2}", level1.imbalance());

        info!("根据 1 级聚类结果划分编码");
        let c1 = level1.centroids.as_slice().unwrap_or_default();
        let (r, _) = update_assignments(x, c1, &self.table);
        let mut xc = vec![vec![]; nc1];
        for (code, &c) in x.chunks_exact(m).zip(&r) {
            xc[c].extend_from_slice(code);
        }

        // 此处使用了累加和+错位相减来进行加权分配，这样可以保证 sum(nc2) = kc
        let bc_sum = xc
            .iter()
            .scan(0, |acc, x| {
                *acc += x.len() / m;
                Some(*acc)
            })
            .collect::<Vec<_>>();
        let mut nc2 = bc_sum.iter().map(|x| x * kc / n).collect::<Vec<_>>();
        for i in (1..nc2.len()).rev() {
            nc2[i] -= nc2[i - 1];
        }
        debug_assert_eq!(nc2.iter().sum::<usize>(), kc);
        info!(
            "2 级聚类中心点数量：{} ~ {}",
            nc2.iter().min().copied().unwrap_or(0),
            nc2.iter().max().copied().unwrap_or(0)
        );

        let mut centroids = Vec::with_capacity(kc * m);
        let mut warnings = level1.warnings;
        let mut termination = level1.termination;
        let mut iterations = level1.iterations;
        let pb = progress_bar(nc1, self.config.verbose);
        for (i, sub) in xc.iter().enumerate().progress_with(pb.clone()) {
            if nc2[i] == 0 {
                continue;
            }
            let seed = self.config.seed.map(|s| s.wrapping_add(i as u64 + 1));
            let ks = self.lloyd(sub, nc2[i], seed, start, &ProgressBar::hidden())?;
            pb.set_message(format!(
                "对 {} 个编码进行 2 级聚类，中心点数量 = {}，不平衡度 = {:.2}",
                sub.len() / m,
                nc2[i],
                ks.imbalance()
            ));
            let offset = centroids.len() / m;
            warnings.extend(ks.warnings.iter().map(|w| match *w {
                FitWarning::EmptyClusterRecovered { cluster, iteration } => {
                    FitWarning::EmptyClusterRecovered { cluster: cluster + offset, iteration }
                }
                other => other,
            }));
            termination = merge_termination(termination, ks.termination);
            iterations = iterations.max(ks.iterations);
            centroids.extend_from_slice(ks.centroids.as_slice().unwrap_or_default());
        }
        pb.finish_with_message("2 级聚类完成");

        let (mut assignments, mut distsum) = update_assignments(x, &centroids, &self.table);
        let mut centroid_frequency = frequency(&assignments, kc);
        if repair_empty_clusters(
            x,
            m,
            &mut assignments,
            &mut centroid_frequency,
            &mut centroids,
            &mut rng,
            iterations,
            &mut warnings,
        ) {
            distsum = total_distance(x, &assignments, &centroids, &self.table);
        }
        info!("总距离：{distsum:.2}，不平衡度：{:.2}", imbalance_factor(&centroid_frequency));

        Ok(FitResult {
            assignments,
            centroids: to_matrix(centroids, kc, m)?,
            distsum,
            iterations,
            termination,
            centroid_frequency,
            warnings,
        })
    }

    fn validate(&self, x: &[u8], width: usize, kc: usize) -> Result<()> {
        validate_codes(x, width, self.table.m(), self.table.k())?;
        if kc == 0 {
            return Err(PqkError::InvalidParameter("聚类中心数量不能为 0".to_string()));
        }
        let n = x.len() / width;
        if n < kc {
            return Err(PqkError::InvalidParameter(format!(
                "编码数量 {n} 少于聚类中心数量 {kc}"
            )));
        }
        Ok(())
    }

    fn stop_reason(&self, start: Instant) -> Option<Termination> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Some(Termination::Cancelled);
        }
        if self.config.time_limit.is_some_and(|limit| start.elapsed() >= limit) {
            return Some(Termination::TimeLimit);
        }
        None
    }

    /// Lloyd 迭代，x 已经过检查，且编码数量不少于 kc
    ///
    /// 每完成一轮 pb 前进一格，结束后停在实际迭代次数上
    fn lloyd(
        &self,
        x: &[u8],
        kc: usize,
        seed: Option<u64>,
        start: Instant,
        pb: &ProgressBar,
    ) -> Result<FitResult> {
        let table = &*self.table;
        let m = table.m();
        let mut rng = seeded_rng(seed);
        let mut warnings = vec![];

        let mut centroids = match self.config.init {
            InitMethod::Random => init_random(x, m, kc, &mut rng),
            InitMethod::PlusPlus => init_plusplus(x, m, kc, table, &mut rng),
        };
        enter(FitPhase::Initialized);

        enter(FitPhase::Assigning);
        let (mut assignments, mut distsum) = update_assignments(x, &centroids, table);
        let mut centroid_frequency = frequency(&assignments, kc);

        let mut iterations = 0;
        let mut termination = Termination::MaxIterations;
        while iterations < self.config.max_iter {
            if let Some(reason) = self.stop_reason(start) {
                info!("聚类在第 {iterations} 轮后提前结束：{reason:?}");
                termination = reason;
                break;
            }
            iterations += 1;

            enter(FitPhase::Updating);
            repair_empty_clusters(
                x,
                m,
                &mut assignments,
                &mut centroid_frequency,
                &mut centroids,
                &mut rng,
                iterations,
                &mut warnings,
            );
            centroids = update_centroids(x, &assignments, &centroids, table);

            enter(FitPhase::Assigning);
            let (new_assignments, new_distsum) = update_assignments(x, &centroids, table);

            enter(FitPhase::ConvergenceCheck);
            let changed =
                assignments.par_iter().zip(&new_assignments).filter(|(a, b)| a != b).count();
            assignments = new_assignments;
            centroid_frequency = frequency(&assignments, kc);
            let delta = new_distsum - distsum;
            // 上一轮距离和已经为 0 时无法再改善
            let stalled = distsum <= 0.0 || -delta / distsum < self.config.epsilon;
            distsum = new_distsum;
            pb.inc(1);
            pb.set_message(format!("距离和：{distsum:.2}"));

            if self.config.verbose {
                info!(
                    "第 {} 轮 - 不平衡度：{:.2} | 距离和变化：{:+.2} | 变化数量：{}",
                    iterations,
                    imbalance_factor(&centroid_frequency),
                    delta,
                    changed
                );
            }
            if let Some(callback) = &self.callback {
                callback(&IterationStats {
                    iteration: iterations,
                    distsum,
                    delta,
                    changed,
                    centroid_frequency: &centroid_frequency,
                });
            }

            if changed == 0 || stalled {
                termination = Termination::Converged;
                break;
            }
        }

        pb.abandon_with_message(format!("聚类结束：{termination:?}，距离和：{distsum:.2}"));
        if termination == Termination::MaxIterations {
            let w = FitWarning::NonConvergence { iterations };
            warn!("{w}");
            warnings.push(w);
        }

        // 最后一次分配也可能产生空聚类
        if repair_empty_clusters(
            x,
            m,
            &mut assignments,
            &mut centroid_frequency,
            &mut centroids,
            &mut rng,
            iterations,
            &mut warnings,
        ) {
            distsum = total_distance(x, &assignments, &centroids, table);
        }
        enter(FitPhase::Terminated);

        Ok(FitResult {
            assignments,
            centroids: to_matrix(centroids, kc, m)?,
            distsum,
            iterations,
            termination,
            centroid_frequency,
            warnings,
        })
    }
}

/// 使用默认参数对编码进行聚类
pub fn fit(
    codes: ArrayView2<'_, u8>,
    table: Arc<DistanceTable>,
    kc: usize,
    max_iter: usize,
    epsilon: f64,
    seed: u64,
) -> Result<FitResult> {
    let config = FitConfig::new(kc).with_max_iter(max_iter).with_epsilon(epsilon).with_seed(seed);
    PqKMeans::new(table, config).fit(codes)
}

/// 将每个编码分配给最近的聚类中心，返回分配结果和总距离
pub fn assign(
    codes: ArrayView2<'_, u8>,
    centroids: ArrayView2<'_, u8>,
    table: &DistanceTable,
) -> Result<(Vec<usize>, f64)> {
    let x = codes.as_standard_layout();
    let x = flat(&x)?;
    let c = centroids.as_standard_layout();
    let c = flat(&c)?;
    validate_codes(x, codes.ncols(), table.m(), table.k())?;
    validate_codes(c, centroids.ncols(), table.m(), table.k())?;
    if c.is_empty() {
        return Err(PqkError::InvalidParameter("聚类中心不能为空".to_string()));
    }
    Ok(update_assignments(x, c, table))
}

fn enter(phase: FitPhase) {
    debug!("进入阶段 {phase:?}");
}

fn merge_termination(a: Termination, b: Termination) -> Termination {
    use Termination::*;
    match (a, b) {
        (Cancelled, _) | (_, Cancelled) => Cancelled,
        (TimeLimit, _) | (_, TimeLimit) => TimeLimit,
        (MaxIterations, _) | (_, MaxIterations) => MaxIterations,
        _ => Converged,
    }
}

fn to_matrix(centroids: Vec<u8>, kc: usize, m: usize) -> Result<Array2<u8>> {
    Array2::from_shape_vec((kc, m), centroids).map_err(|e| PqkError::InvalidParameter(e.to_string()))
}

/// 不放回地随机选取 kc 个编码作为初始中心
fn init_random<R: Rng>(x: &[u8], m: usize, kc: usize, rng: &mut R) -> Vec<u8> {
    let n = x.len() / m;
    let mut centroids = Vec::with_capacity(kc * m);
    for i in index::sample(rng, n, kc) {
        centroids.extend_from_slice(&x[i * m..(i + 1) * m]);
    }
    centroids
}

/// kmeans++ 初始化，按到已选中心的最小距离加权采样
fn init_plusplus<R: Rng>(
    x: &[u8],
    m: usize,
    kc: usize,
    table: &DistanceTable,
    rng: &mut R,
) -> Vec<u8> {
    let n = x.len() / m;
    let first = rng.random_range(0..n);
    let mut centroids = Vec::with_capacity(kc * m);
    centroids.extend_from_slice(&x[first * m..(first + 1) * m]);

    let mut min_dist: Vec<f32> =
        x.par_chunks_exact(m).map(|code| table.distance(code, &centroids)).collect();

    for _ in 1..kc {
        let total: f64 = min_dist.iter().map(|&d| d as f64).sum();
        let next = if total > 0.0 {
            let mut r = rng.random::<f64>() * total;
            let mut next = 0;
            for (i, &d) in min_dist.iter().enumerate() {
                if d <= 0.0 {
                    continue;
                }
                next = i;
                r -= d as f64;
                if r < 0.0 {
                    break;
                }
            }
            next
        } else {
            // 剩余编码都与已有中心重合
            rng.random_range(0..n)
        };

        let code = &x[next * m..(next + 1) * m];
        centroids.extend_from_slice(code);
        min_dist.par_iter_mut().zip(x.par_chunks_exact(m)).for_each(|(d, c)| {
            *d = d.min(table.distance(c, code));
        });
    }
    centroids
}

/// 将每个点分配给最近的聚类中心，并返回聚类中心的序号和总距离
fn update_assignments(x: &[u8], centroids: &[u8], table: &DistanceTable) -> (Vec<usize>, f64) {
    let (assignments, distances): (Vec<_>, Vec<_>) =
        x.par_chunks_exact(table.m()).map(|code| table.nearest(code, centroids)).unzip();
    let distsum = distances.iter().map(|&d: &f32| d as f64).sum();
    (assignments, distsum)
}

fn frequency(assignments: &[usize], kc: usize) -> Vec<usize> {
    let mut freq = vec![0; kc];
    for &a in assignments {
        freq[a] += 1;
    }
    freq
}

fn total_distance(x: &[u8], assignments: &[usize], centroids: &[u8], table: &DistanceTable) -> f64 {
    let m = table.m();
    x.par_chunks_exact(m)
        .zip(assignments)
        .map(|(code, &c)| table.distance(code, &centroids[c * m..(c + 1) * m]) as f64)
        .sum()
}

/// 处理空聚类：从当前最大的聚类中随机取一个编码移入空聚类，并以该编码作为新中心
///
/// 编码数量不少于 kc 时，最大的聚类至少有两个成员，因此移出后不会产生新的空聚类。
/// 返回是否进行了修复。
#[allow(clippy::too_many_arguments)]
fn repair_empty_clusters<R: Rng>(
    x: &[u8],
    m: usize,
    assignments: &mut [usize],
    freq: &mut [usize],
    centroids: &mut [u8],
    rng: &mut R,
    iteration: usize,
    warnings: &mut Vec<FitWarning>,
) -> bool {
    let mut repaired = false;
    for c in 0..freq.len() {
        if freq[c] > 0 {
            continue;
        }
        let largest = (0..freq.len()).max_by_key(|&i| freq[i]).unwrap_or(0);
        let Some(i) = assignments
            .iter()
            .enumerate()
            .filter(|&(_, &a)| a == largest)
            .map(|(i, _)| i)
            .choose(rng)
        else {
            continue;
        };

        assignments[i] = c;
        freq[largest] -= 1;
        freq[c] = 1;
        centroids[c * m..(c + 1) * m].copy_from_slice(&x[i * m..(i + 1) * m]);

        let w = FitWarning::EmptyClusterRecovered { cluster: c, iteration };
        warn!("{w}，从聚类 {largest} 中移入编码 {i}");
        warnings.push(w);
        repaired = true;
    }
    repaired
}

/// 更新聚类中心
///
/// 每个线程先统计自己那部分编码的 (聚类, 子空间, 子索引) 直方图，最后合并，
/// 再对每个 (聚类, 子空间) 独立地求使距离和最小的子索引。
fn update_centroids(
    x: &[u8],
    assignments: &[usize],
    old: &[u8],
    table: &DistanceTable,
) -> Vec<u8> {
    let (m, k) = (table.m(), table.k());
    let kc = old.len() / m;
    let hist = histograms(x, assignments, kc, m, k);

    hist.par_chunks_exact(m * k)
        .zip(old.par_chunks_exact(m))
        .flat_map_iter(|(h, old)| {
            // 所有子空间的直方图总数相同，都等于聚类大小
            let empty = h[..k].iter().all(|&c| c == 0);
            (0..m).map(move |sub| {
                if empty {
                    old[sub]
                } else {
                    best_subcode(&h[sub * k..(sub + 1) * k], table.subspace(sub), k)
                }
            })
        })
        .collect()
}

fn histograms(x: &[u8], assignments: &[usize], kc: usize, m: usize, k: usize) -> Vec<u32> {
    let size = kc * m * k;
    let n = assignments.len();
    let rows = (n / (rayon::current_num_threads() * 4)).max(4096);
    x.par_chunks(rows * m)
        .zip(assignments.par_chunks(rows))
        .fold(
            || vec![0u32; size],
            |mut hist, (codes, assign)| {
                for (code, &c) in codes.chunks_exact(m).zip(assign) {
                    let base = c * m * k;
                    for (sub, &v) in code.iter().enumerate() {
                        hist[base + sub * k + v as usize] += 1;
                    }
                }
                hist
            },
        )
        .reduce(
            || vec![0u32; size],
            |mut a, b| {
                a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                a
            },
        )
}

/// 在 K 个候选子索引中，找出到直方图中所有成员距离之和最小的一个，相同时取序号最小的
fn best_subcode(hist: &[u32], slab: &[f32], k: usize) -> u8 {
    let votes: Vec<(usize, f64)> =
        hist.iter().enumerate().filter(|&(_, &c)| c > 0).map(|(j, &c)| (j, c as f64)).collect();

    let mut best = (0, f64::INFINITY);
    for cand in 0..k {
        let row = &slab[cand * k..(cand + 1) * k];
        let cost: f64 = votes.iter().map(|&(j, c)| c * row[j] as f64).sum();
        if cost < best.1 {
            best = (cand, cost);
        }
    }
    best.0 as u8
}
