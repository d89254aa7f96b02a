use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PqkError, Result};

/// 单字节编码能表示的最大子聚类中心数量
pub const MAX_SUB_CENTROIDS: usize = 256;

/// 码本训练参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// 子空间数量 M，向量维度必须能被 M 整除
    pub m: usize,
    /// 每个子空间的子聚类中心数量 K，取值 1 ~ 256
    pub k: usize,
    /// 子空间 kmeans 的最大迭代次数
    pub max_iter: usize,
    /// 子聚类中心最大移动距离（平方）小于该值时停止迭代
    pub tolerance: f32,
    /// 用于训练的样本数量，None 表示使用全部向量
    pub training_samples: Option<usize>,
    /// 随机种子，None 时使用系统熵源
    pub seed: Option<u64>,
    /// 是否显示进度条
    pub verbose: bool,
}

impl TrainConfig {
    pub fn new(m: usize, k: usize) -> Self {
        Self { m, k, ..Default::default() }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_training_samples(mut self, samples: usize) -> Self {
        self.training_samples = Some(samples);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// 检查参数，返回子空间宽度 D / M
    pub fn validate(&self, dim: usize) -> Result<usize> {
        if self.m == 0 || dim == 0 || dim % self.m != 0 {
            return Err(PqkError::InvalidDimension { dim, m: self.m });
        }
        if self.k == 0 || self.k > MAX_SUB_CENTROIDS {
            return Err(PqkError::InvalidParameter(format!(
                "K 必须在 1 ~ {MAX_SUB_CENTROIDS} 之间，实际为 {}",
                self.k
            )));
        }
        Ok(dim / self.m)
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            m: 4,
            k: 256,
            max_iter: 25,
            tolerance: 1e-6,
            training_samples: None,
            seed: None,
            verbose: false,
        }
    }
}

/// 聚类中心初始化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMethod {
    /// 不放回地随机选取 Kc 个编码
    #[default]
    Random,
    /// 在编码空间中使用 kmeans++ 的 D² 采样
    PlusPlus,
}

/// PQk-means 聚类参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// 聚类中心数量 Kc
    pub kc: usize,
    /// 最大迭代次数
    pub max_iter: usize,
    /// 总距离的相对改善小于该值时视为收敛
    pub epsilon: f64,
    pub seed: Option<u64>,
    pub init: InitMethod,
    /// 聚类的时间预算，只在两轮迭代之间检查
    pub time_limit: Option<Duration>,
    /// 是否打印每一轮的信息
    pub verbose: bool,
}

impl FitConfig {
    pub fn new(kc: usize) -> Self {
        Self { kc, ..Default::default() }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_init(mut self, init: InitMethod) -> Self {
        self.init = init;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            kc: 8,
            max_iter: 20,
            epsilon: 1e-4,
            seed: None,
            init: InitMethod::Random,
            time_limit: None,
            verbose: false,
        }
    }
}
