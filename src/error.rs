use std::fmt;

use thiserror::Error;

/// 不可恢复的错误，出现时当前操作会被中止
#[derive(Error, Debug)]
pub enum PqkError {
    /// 向量维度无法被子空间数量整除
    #[error("维度 {dim} 无法被子空间数量 {m} 整除")]
    InvalidDimension { dim: usize, m: usize },

    #[error("参数无效：{0}")]
    InvalidParameter(String),

    #[error("子空间 {subspace} 的训练数据不足：至少需要 {required} 个，实际只有 {actual} 个")]
    InsufficientTrainingData { subspace: usize, required: usize, actual: usize },

    /// 编码或向量的长度与码本不一致
    #[error("维度不匹配：期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 编码中的子索引超出 [0, K)
    #[error("第 {index} 个编码的子空间 {subspace} 取值 {value} 超出范围 [0, {k})")]
    CodeOutOfRange { index: usize, subspace: usize, value: u8, k: usize },

    #[error("序列化错误：{0}")]
    SerializationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),
}

pub type Result<T> = std::result::Result<T, PqkError>;

/// 聚类过程中可以自动恢复的情况，不会中止聚类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitWarning {
    /// 第 `iteration` 轮中，聚类 `cluster` 没有分配到任何向量，已重新选取中心
    EmptyClusterRecovered { cluster: usize, iteration: usize },
    /// 达到最大迭代次数仍未收敛
    NonConvergence { iterations: usize },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::EmptyClusterRecovered { cluster, iteration } => {
                write!(f, "第 {iteration} 轮中聚类 {cluster} 为空，已重新选取中心")
            }
            FitWarning::NonConvergence { iterations } => {
                write!(f, "迭代 {iterations} 轮后仍未收敛")
            }
        }
    }
}
