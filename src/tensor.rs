//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现 Transformer 所需的 2-D 矩阵操作。所有矩阵均为 `f64`，
//! 以便有限差分梯度检查能够达到足够的精度。

use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ModelError, Result};

/// 引擎中使用的唯一矩阵类型
pub type Matrix = Array2<f64>;

/// 创建参数初始化用的随机数生成器
///
/// - `Some(seed)`: 确定性初始化（测试、调试）
/// - `None`: 使用系统熵
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// 检查矩阵形状
pub(crate) fn ensure_shape(what: &str, m: &Matrix, expected: (usize, usize)) -> Result<()> {
    if m.dim() != expected {
        return Err(ModelError::shape(what, expected, m.dim()));
    }
    Ok(())
}

/// 张量扩展 trait
pub trait TensorExt: Sized {
    /// 创建均匀分布随机矩阵，取值范围 [-limit, limit)
    fn random_uniform<R: Rng>(shape: (usize, usize), limit: f64, rng: &mut R) -> Self;

    /// 带形状检查的矩阵乘法
    fn matmul(&self, other: &Self) -> Result<Self>;

    /// 按行的数值稳定 softmax（先减去行最大值）
    fn softmax_rows(&self) -> Self;

    /// 列求和，返回 [1, cols]
    fn column_sums(&self) -> Self;

    /// 按列拼接（多头输出合并）
    fn hconcat(parts: &[Self]) -> Result<Self>;

    /// 按列等分（多头梯度拆分），顺序与 `hconcat` 一致
    fn split_columns(&self, n_parts: usize) -> Result<Vec<Self>>;

    /// 指定行的最大值下标
    fn argmax_row(&self, row: usize) -> usize;
}

impl TensorExt for Matrix {
    fn random_uniform<R: Rng>(shape: (usize, usize), limit: f64, rng: &mut R) -> Matrix {
        if limit <= 0.0 {
            return Array2::zeros(shape);
        }
        Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..limit))
    }

    fn matmul(&self, other: &Matrix) -> Result<Matrix> {
        if self.ncols() != other.nrows() {
            return Err(ModelError::ShapeMismatch(format!(
                "cannot multiply {}x{} by {}x{}",
                self.nrows(),
                self.ncols(),
                other.nrows(),
                other.ncols()
            )));
        }
        Ok(self.dot(other))
    }

    fn softmax_rows(&self) -> Matrix {
        let mut out = self.clone();
        for mut row in out.rows_mut() {
            let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|x| x / sum);
        }
        out
    }

    fn column_sums(&self) -> Matrix {
        self.sum_axis(Axis(0)).insert_axis(Axis(0))
    }

    fn hconcat(parts: &[Matrix]) -> Result<Matrix> {
        if parts.is_empty() {
            return Err(ModelError::ShapeMismatch(
                "cannot concatenate zero matrices".to_string(),
            ));
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        ndarray::concatenate(Axis(1), &views)
            .map_err(|e| ModelError::ShapeMismatch(format!("concatenate: {}", e)))
    }

    fn split_columns(&self, n_parts: usize) -> Result<Vec<Matrix>> {
        if n_parts == 0 || self.ncols() % n_parts != 0 {
            return Err(ModelError::ShapeMismatch(format!(
                "cannot split {} columns into {} equal parts",
                self.ncols(),
                n_parts
            )));
        }
        let width = self.ncols() / n_parts;
        Ok((0..n_parts)
            .map(|i| self.slice(s![.., i * width..(i + 1) * width]).to_owned())
            .collect())
    }

    fn argmax_row(&self, row: usize) -> usize {
        let mut best = 0;
        let mut best_value = f64::NEG_INFINITY;
        for (j, &v) in self.row(row).iter().enumerate() {
            if v > best_value {
                best_value = v;
                best = j;
            }
        }
        best
    }
}
