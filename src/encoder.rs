use ndarray::{Array2, ArrayView2, s};
use rayon::prelude::*;

use crate::codebook::Codebook;
use crate::distance::{l2sqr, nearest};
use crate::error::{PqkError, Result};
use crate::utils::flat;

fn check_dim(codebook: &Codebook, dim: usize) -> Result<()> {
    if dim != codebook.dim() {
        return Err(PqkError::DimensionMismatch { expected: codebook.dim(), actual: dim });
    }
    Ok(())
}

/// 不做检查的编码，out 长度为 M
#[inline]
fn encode_into(vector: &[f32], codebook: &Codebook, out: &mut [u8]) {
    let ds = codebook.ds();
    for (sub, (x, o)) in vector.chunks_exact(ds).zip(out.iter_mut()).enumerate() {
        *o = nearest(x, codebook.subspace(sub), ds).0 as u8;
    }
}

/// 将一个 D 维向量编码为 M 个子索引
pub fn encode(vector: &[f32], codebook: &Codebook) -> Result<Vec<u8>> {
    check_dim(codebook, vector.len())?;
    let mut code = vec![0; codebook.m()];
    encode_into(vector, codebook, &mut code);
    Ok(code)
}

/// 并行编码 N×D 的向量矩阵，返回 N×M 的编码矩阵
pub fn encode_batch(vectors: ArrayView2<'_, f32>, codebook: &Codebook) -> Result<Array2<u8>> {
    check_dim(codebook, vectors.ncols())?;
    let (n, d, m) = (vectors.nrows(), codebook.dim(), codebook.m());

    let x = vectors.as_standard_layout();
    let x = flat(&x)?;
    let mut codes = vec![0u8; n * m];
    codes
        .par_chunks_exact_mut(m)
        .zip(x.par_chunks_exact(d))
        .for_each(|(code, vector)| encode_into(vector, codebook, code));

    Array2::from_shape_vec((n, m), codes).map_err(|e| PqkError::InvalidParameter(e.to_string()))
}

/// 分块编码，每次迭代返回 chunk_rows 行的编码结果
///
/// 适用于数据量太大、不希望一次性持有全部中间结果的场景
pub fn encode_chunks<'a>(
    vectors: ArrayView2<'a, f32>,
    codebook: &'a Codebook,
    chunk_rows: usize,
) -> Result<impl Iterator<Item = Result<Array2<u8>>> + 'a> {
    check_dim(codebook, vectors.ncols())?;
    if chunk_rows == 0 {
        return Err(PqkError::InvalidParameter("chunk_rows 不能为 0".to_string()));
    }
    let n = vectors.nrows();
    Ok((0..n).step_by(chunk_rows).map(move |start| {
        let end = (start + chunk_rows).min(n);
        encode_batch(vectors.slice(s![start..end, ..]), codebook)
    }))
}

/// 将编码还原为近似向量，只用于诊断等场景
pub fn decode(code: &[u8], codebook: &Codebook) -> Result<Vec<f32>> {
    codebook.check_code(code)?;
    let mut vector = Vec::with_capacity(codebook.dim());
    for (sub, &c) in code.iter().enumerate() {
        vector.extend_from_slice(codebook.centroid(sub, c as usize));
    }
    Ok(vector)
}

/// 批量还原 N×M 的编码矩阵，返回 N×D 的向量矩阵
pub fn decode_batch(codes: ArrayView2<'_, u8>, codebook: &Codebook) -> Result<Array2<f32>> {
    let c = codes.as_standard_layout();
    let c = flat(&c)?;
    codebook.check_codes(c, codes.ncols())?;

    let (n, d, ds) = (codes.nrows(), codebook.dim(), codebook.ds());
    let mut out = vec![0f32; n * d];
    out.par_chunks_exact_mut(d).zip(c.par_chunks_exact(codebook.m())).for_each(|(v, code)| {
        for (sub, (dst, &k)) in v.chunks_exact_mut(ds).zip(code).enumerate() {
            dst.copy_from_slice(codebook.centroid(sub, k as usize));
        }
    });

    Array2::from_shape_vec((n, d), out).map_err(|e| PqkError::InvalidParameter(e.to_string()))
}

/// 平均重建误差（平方距离）
pub fn reconstruction_error(
    vectors: ArrayView2<'_, f32>,
    codes: ArrayView2<'_, u8>,
    codebook: &Codebook,
) -> Result<f32> {
    check_dim(codebook, vectors.ncols())?;
    if vectors.nrows() != codes.nrows() {
        return Err(PqkError::DimensionMismatch { expected: vectors.nrows(), actual: codes.nrows() });
    }
    if vectors.nrows() == 0 {
        return Ok(0.0);
    }
    let x = vectors.as_standard_layout();
    let x = flat(&x)?;
    let c = codes.as_standard_layout();
    let c = flat(&c)?;
    codebook.check_codes(c, codes.ncols())?;

    let ds = codebook.ds();
    let total: f64 = x
        .par_chunks_exact(codebook.dim())
        .zip(c.par_chunks_exact(codebook.m()))
        .map(|(v, code)| {
            v.chunks_exact(ds)
                .zip(code)
                .enumerate()
                .map(|(sub, (x, &k))| l2sqr(x, codebook.centroid(sub, k as usize)) as f64)
                .sum::<f64>()
        })
        .sum();
    Ok((total / vectors.nrows() as f64) as f32)
}
