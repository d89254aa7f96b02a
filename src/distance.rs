//! 子聚类中心之间的距离表
//!
//! 两个编码之间的近似距离等于 M 个子空间查表结果之和，因此聚类过程中
//! 每次距离计算只需要 O(M) 次查表，与原始维度 D 无关。

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codebook::Codebook;
use crate::encoder::encode;
use crate::error::{PqkError, Result};

/// 平方欧氏距离
#[inline(always)]
pub fn l2sqr(va: &[f32], vb: &[f32]) -> f32 {
    va.iter().zip(vb).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// 在展平的 n * d 数组中寻找与 x 最近的向量，距离相同时取序号最小的
#[inline]
pub(crate) fn nearest(x: &[f32], centroids: &[f32], d: usize) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centroids.chunks_exact(d).enumerate() {
        let dis = l2sqr(x, c);
        if dis < best.1 {
            best = (i, dis);
        }
    }
    best
}

/// M×K×K 的对称距离表，(m, i, j) 为子空间 m 中第 i 和第 j 个子聚类中心的平方距离
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceTable {
    m: usize,
    k: usize,
    data: Vec<f32>,
}

/// 由码本构建距离表，只依赖码本本身，码本不变时无需重建
pub fn build_distance_table(codebook: &Codebook) -> DistanceTable {
    let (m, k, ds) = (codebook.m(), codebook.k(), codebook.ds());
    let data = (0..m)
        .into_par_iter()
        .flat_map_iter(|sub| {
            let centroids = codebook.subspace(sub);
            let mut slab = vec![0.0f32; k * k];
            for i in 0..k {
                let ci = &centroids[i * ds..(i + 1) * ds];
                for j in (i + 1)..k {
                    let d = l2sqr(ci, &centroids[j * ds..(j + 1) * ds]);
                    slab[i * k + j] = d;
                    slab[j * k + i] = d;
                }
            }
            slab
        })
        .collect();
    DistanceTable { m, k, data }
}

impl DistanceTable {
    pub fn m(&self) -> usize {
        self.m
    }

    pub fn k(&self) -> usize {
        self.k
    }

    #[inline(always)]
    pub fn lookup(&self, m: usize, i: usize, j: usize) -> f32 {
        self.data[(m * self.k + i) * self.k + j]
    }

    /// 子空间 m 的 K×K 距离矩阵，行优先
    pub fn subspace(&self, m: usize) -> &[f32] {
        &self.data[m * self.k * self.k..(m + 1) * self.k * self.k]
    }

    /// 两个编码之间的近似平方距离
    ///
    /// 调用者需保证编码长度为 M 且每个子索引小于 K
    #[inline]
    pub fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
        let kk = self.k * self.k;
        let mut sum = 0.0;
        for (m, (&x, &y)) in a.iter().zip(b).enumerate() {
            sum += self.data[m * kk + x as usize * self.k + y as usize];
        }
        sum
    }

    /// 在展平的 Kc * M 聚类中心中寻找距离 code 最近的一个，距离相同时取序号最小的
    #[inline]
    pub fn nearest(&self, code: &[u8], centroids: &[u8]) -> (usize, f32) {
        let mut best = (0, f32::INFINITY);
        for (c, centroid) in centroids.chunks_exact(self.m).enumerate() {
            let d = self.distance(code, centroid);
            if d < best.1 {
                best = (c, d);
            }
        }
        best
    }
}

/// M×K 的非对称距离表，(m, k) 为原始查询向量第 m 段与第 k 个子聚类中心的平方距离
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTable {
    m: usize,
    k: usize,
    data: Vec<f32>,
}

impl QueryTable {
    pub fn new(query: &[f32], codebook: &Codebook) -> Result<Self> {
        if query.len() != codebook.dim() {
            return Err(PqkError::DimensionMismatch {
                expected: codebook.dim(),
                actual: query.len(),
            });
        }
        let (m, k, ds) = (codebook.m(), codebook.k(), codebook.ds());
        let mut data = Vec::with_capacity(m * k);
        for (sub, x) in query.chunks_exact(ds).enumerate() {
            data.extend(codebook.subspace(sub).chunks_exact(ds).map(|c| l2sqr(x, c)));
        }
        Ok(Self { m, k, data })
    }

    #[inline(always)]
    pub fn lookup(&self, m: usize, k: usize) -> f32 {
        self.data[m * self.k + k]
    }

    #[inline]
    pub fn distance(&self, code: &[u8]) -> f32 {
        code.iter().enumerate().map(|(m, &c)| self.data[m * self.k + c as usize]).sum()
    }

    pub fn nearest(&self, centroids: &[u8]) -> (usize, f32) {
        let mut best = (0, f32::INFINITY);
        for (c, centroid) in centroids.chunks_exact(self.m).enumerate() {
            let d = self.distance(centroid);
            if d < best.1 {
                best = (c, d);
            }
        }
        best
    }
}

/// 原始向量查询时使用的距离计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceStrategy {
    /// 先编码查询向量，再使用对称距离表
    #[default]
    Symmetric,
    /// 直接计算查询向量到各子聚类中心的距离
    Asymmetric,
}

/// 针对一个原始查询向量构建好的距离计算器
#[derive(Debug, Clone)]
pub enum QueryDistance<'a> {
    Symmetric { table: &'a DistanceTable, code: Vec<u8> },
    Asymmetric(QueryTable),
}

impl<'a> QueryDistance<'a> {
    pub fn build(
        strategy: DistanceStrategy,
        query: &[f32],
        codebook: &Codebook,
        table: &'a DistanceTable,
    ) -> Result<Self> {
        Ok(match strategy {
            DistanceStrategy::Symmetric => {
                QueryDistance::Symmetric { table, code: encode(query, codebook)? }
            }
            DistanceStrategy::Asymmetric => {
                QueryDistance::Asymmetric(QueryTable::new(query, codebook)?)
            }
        })
    }

    pub fn distance(&self, code: &[u8]) -> f32 {
        match self {
            QueryDistance::Symmetric { table, code: query } => table.distance(query, code),
            QueryDistance::Asymmetric(qt) => qt.distance(code),
        }
    }

    pub fn nearest(&self, centroids: &[u8]) -> (usize, f32) {
        match self {
            QueryDistance::Symmetric { table, code } => table.nearest(code, centroids),
            QueryDistance::Asymmetric(qt) => qt.nearest(centroids),
        }
    }
}
