//! 码本与聚类结果的保存、加载和预测
//!
//! 码本的二进制格式（小端）：
//!
//! ```text
//! b"PQCB" | u32 版本 | u32 M | u32 K | u32 Ds | M*K*Ds 个 f32
//! ```
//!
//! 模型在码本之后追加 `u32 Kc` 和 Kc*M 字节的聚类中心编码。

use std::fs;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::info;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::codebook::{Codebook, validate_codes};
use crate::config::MAX_SUB_CENTROIDS;
use crate::distance::{DistanceStrategy, DistanceTable, QueryDistance, QueryTable, build_distance_table};
use crate::encoder::{decode_batch, encode_batch};
use crate::error::{PqkError, Result};
use crate::kmeans::FitResult;
use crate::utils::flat;

const MAGIC: &[u8; 4] = b"PQCB";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 * 4;

fn corrupted(msg: impl Into<String>) -> PqkError {
    PqkError::SerializationError(msg.into())
}

fn truncated(_: std::io::Error) -> PqkError {
    corrupted("数据不完整")
}

/// 将码本序列化为字节
pub fn save_codebook(codebook: &Codebook) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + codebook.centroids().len() * 4];
    buf[..4].copy_from_slice(MAGIC);
    LittleEndian::write_u32_into(
        &[VERSION, codebook.m() as u32, codebook.k() as u32, codebook.ds() as u32],
        &mut buf[4..HEADER_SIZE],
    );
    LittleEndian::write_f32_into(codebook.centroids(), &mut buf[HEADER_SIZE..]);
    buf
}

/// 从字节中加载码本，数据必须恰好是一个完整的码本
pub fn load_codebook(bytes: &[u8]) -> Result<Codebook> {
    let mut r = bytes;
    let codebook = read_codebook(&mut r)?;
    if !r.is_empty() {
        return Err(corrupted(format!("码本之后有 {} 字节多余数据", r.len())));
    }
    Ok(codebook)
}

fn read_codebook(r: &mut &[u8]) -> Result<Codebook> {
    if r.len() < HEADER_SIZE {
        return Err(corrupted("数据不完整"));
    }
    let rest: &[u8] = *r;
    if rest[..4] != MAGIC[..] {
        return Err(corrupted(format!("魔数错误：{:?}", &rest[..4])));
    }
    *r = &rest[4..];

    let version = r.read_u32::<LittleEndian>().map_err(truncated)?;
    if version != VERSION {
        return Err(corrupted(format!("不支持的版本：{version}")));
    }
    let m = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let k = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let ds = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if m == 0 || ds == 0 || k == 0 || k > MAX_SUB_CENTROIDS {
        return Err(corrupted(format!("码本参数无效：M = {m}，K = {k}，Ds = {ds}")));
    }

    // 先检查剩余长度，避免损坏的头部导致巨大的内存分配
    let len = m
        .checked_mul(k)
        .and_then(|x| x.checked_mul(ds))
        .filter(|x| x.checked_mul(4).is_some_and(|bytes| bytes <= r.len()))
        .ok_or_else(|| corrupted("数据不完整"))?;
    let mut centroids = vec![0f32; len];
    r.read_f32_into::<LittleEndian>(&mut centroids).map_err(truncated)?;
    if centroids.iter().any(|v| !v.is_finite()) {
        return Err(corrupted("码本包含非有限值"));
    }

    Codebook::from_parts(m, k, ds, centroids).map_err(|e| corrupted(e.to_string()))
}

/// 对单个编码进行预测，返回最近的聚类中心序号
///
/// centroids 为 Kc×M 的聚类中心编码
pub fn predict(code: &[u8], centroids: ArrayView2<'_, u8>, table: &DistanceTable) -> Result<usize> {
    validate_codes(code, code.len(), table.m(), table.k())?;
    let c = centroids.as_standard_layout();
    let c = flat(&c)?;
    validate_codes(c, centroids.ncols(), table.m(), table.k())?;
    if c.is_empty() {
        return Err(PqkError::InvalidParameter("聚类中心不能为空".to_string()));
    }
    Ok(table.nearest(code, c).0)
}

/// 训练完成的聚类模型，包含码本、距离表和 Kc 个聚类中心编码
#[derive(Debug, Clone)]
pub struct PqKMeansModel {
    codebook: Arc<Codebook>,
    table: Arc<DistanceTable>,
    centroids: Array2<u8>,
}

impl PqKMeansModel {
    pub fn new(codebook: Arc<Codebook>, centroids: Array2<u8>) -> Result<Self> {
        let table = Arc::new(build_distance_table(&codebook));
        Self::with_table(codebook, table, centroids)
    }

    /// 复用聚类时已经构建好的距离表
    pub fn from_fit(codebook: Arc<Codebook>, table: Arc<DistanceTable>, result: &FitResult) -> Result<Self> {
        if (table.m(), table.k()) != (codebook.m(), codebook.k()) {
            return Err(PqkError::DimensionMismatch {
                expected: codebook.m() * codebook.k(),
                actual: table.m() * table.k(),
            });
        }
        Self::with_table(codebook, table, result.centroids.clone())
    }

    fn with_table(codebook: Arc<Codebook>, table: Arc<DistanceTable>, centroids: Array2<u8>) -> Result<Self> {
        // 之后统一按行优先布局访问
        let centroids = centroids.as_standard_layout().into_owned();
        codebook.check_codes(flat_centroids(&centroids), centroids.ncols())?;
        if centroids.nrows() == 0 {
            return Err(PqkError::InvalidParameter("聚类中心不能为空".to_string()));
        }
        Ok(Self { codebook, table, centroids })
    }

    pub fn codebook(&self) -> &Arc<Codebook> {
        &self.codebook
    }

    pub fn table(&self) -> &Arc<DistanceTable> {
        &self.table
    }

    /// Kc×M 的聚类中心编码
    pub fn centroids(&self) -> ArrayView2<'_, u8> {
        self.centroids.view()
    }

    /// 聚类中心数量
    pub fn kc(&self) -> usize {
        self.centroids.nrows()
    }

    /// 检查外部传入的编码是否与模型的 M 和 K 一致
    pub fn check_codes(&self, codes: ArrayView2<'_, u8>) -> Result<()> {
        let c = codes.as_standard_layout();
        self.check(flat(&c)?, codes.ncols())
    }

    fn check(&self, codes: &[u8], width: usize) -> Result<()> {
        self.codebook
            .check_codes(codes, width)
            .map_err(|e| corrupted(format!("编码与模型参数不一致：{e}")))
    }

    pub fn predict(&self, code: &[u8]) -> Result<usize> {
        self.check(code, code.len())?;
        Ok(self.table.nearest(code, flat_centroids(&self.centroids)).0)
    }

    pub fn predict_batch(&self, codes: ArrayView2<'_, u8>) -> Result<Vec<usize>> {
        let c = codes.as_standard_layout();
        let c = flat(&c)?;
        self.check(c, codes.ncols())?;
        let centroids = flat_centroids(&self.centroids);
        Ok(c.par_chunks_exact(self.codebook.m()).map(|code| self.table.nearest(code, centroids).0).collect())
    }

    /// 对原始向量进行预测
    pub fn predict_vector(&self, vector: &[f32], strategy: DistanceStrategy) -> Result<usize> {
        let qd = QueryDistance::build(strategy, vector, &self.codebook, &self.table)?;
        Ok(qd.nearest(flat_centroids(&self.centroids)).0)
    }

    /// 批量对原始向量进行预测
    pub fn predict_vectors(
        &self,
        vectors: ArrayView2<'_, f32>,
        strategy: DistanceStrategy,
    ) -> Result<Vec<usize>> {
        match strategy {
            DistanceStrategy::Symmetric => {
                let codes = encode_batch(vectors, &self.codebook)?;
                self.predict_batch(codes.view())
            }
            DistanceStrategy::Asymmetric => {
                let dim = self.codebook.dim();
                if vectors.ncols() != dim {
                    return Err(PqkError::DimensionMismatch { expected: dim, actual: vectors.ncols() });
                }
                let x = vectors.as_standard_layout();
                let centroids = flat_centroids(&self.centroids);
                flat(&x)?
                    .par_chunks_exact(dim)
                    .map(|v| -> Result<usize> {
                        Ok(QueryTable::new(v, &self.codebook)?.nearest(centroids).0)
                    })
                    .collect()
            }
        }
    }

    /// 将聚类中心还原为 D 维向量
    pub fn decoded_centroids(&self) -> Result<Array2<f32>> {
        decode_batch(self.centroids.view(), &self.codebook)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = save_codebook(&self.codebook);
        let mut kc = [0u8; 4];
        LittleEndian::write_u32(&mut kc, self.kc() as u32);
        buf.extend_from_slice(&kc);
        buf.extend_from_slice(flat_centroids(&self.centroids));
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let codebook = read_codebook(&mut r)?;
        let kc = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let m = codebook.m();
        if kc == 0 {
            return Err(corrupted("聚类中心数量为 0"));
        }
        if kc.checked_mul(m) != Some(r.len()) {
            return Err(corrupted(format!("聚类中心数据长度错误：期望 {} 字节，实际 {} 字节", kc * m, r.len())));
        }
        let centroids = Array2::from_shape_vec((kc, m), r.to_vec()).map_err(|e| corrupted(e.to_string()))?;
        codebook.check_codes(r, m).map_err(|e| corrupted(format!("聚类中心编码无效：{e}")))?;
        Self::new(Arc::new(codebook), centroids)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path.as_ref(), self.to_bytes())?;
        info!("模型已保存至 {}", path.as_ref().display());
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let model = Self::from_bytes(&fs::read(path.as_ref())?)?;
        info!(
            "从 {} 加载模型，M = {}，K = {}，Kc = {}",
            path.as_ref().display(),
            model.codebook.m(),
            model.codebook.k(),
            model.kc()
        );
        Ok(model)
    }
}

/// 聚类中心在构造时已转为行优先布局
fn flat_centroids(centroids: &Array2<u8>) -> &[u8] {
    centroids.as_slice().unwrap_or_default()
}
