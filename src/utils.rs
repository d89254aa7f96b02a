use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, CowArray, Ix2};
use ndarray_npy::{read_npy, write_npy};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::{PqkError, Result};

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// 根据 verbose 创建进度条，不需要输出时返回隐藏的进度条
pub fn progress_bar(len: usize, verbose: bool) -> ProgressBar {
    if verbose {
        ProgressBar::new(len as u64).with_style(pb_style())
    } else {
        ProgressBar::hidden()
    }
}

/// 计算不平衡因子，完全均衡时为 1
pub fn imbalance_factor(hist: &[usize]) -> f64 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f64;
        tot += h;
        uf += h.powi(2);
    }
    if tot == 0.0 {
        return 0.0;
    }
    uf * hist.len() as f64 / tot.powi(2)
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// 取出行优先布局矩阵的底层数据，需要先调用 `as_standard_layout`
pub(crate) fn flat<'a, A>(x: &'a CowArray<'_, A, Ix2>) -> Result<&'a [A]> {
    x.as_slice().ok_or_else(|| PqkError::InvalidParameter("矩阵不是连续内存布局".to_string()))
}

/// 将 N×M 的编码矩阵保存为 .npy 文件
pub fn write_codes<P: AsRef<Path>>(path: P, codes: &Array2<u8>) -> Result<()> {
    write_npy(path, codes)?;
    Ok(())
}

/// 从 .npy 文件读取 N×M 的编码矩阵
pub fn read_codes<P: AsRef<Path>>(path: P) -> Result<Array2<u8>> {
    Ok(read_npy(path)?)
}
