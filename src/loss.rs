//! 损失函数与评估指标
//!
//! 交叉熵损失（带缓存的 forward/backward 对）和分类准确率。

use crate::error::{ModelError, Result};
use crate::tensor::{Matrix, TensorExt};

/// log 内的小常数，避免 log(0)
pub const LOG_EPS: f64 = 1e-9;

/// 交叉熵损失的缓存
#[derive(Debug, Clone)]
struct CrossEntropyCache {
    probabilities: Matrix,
    target: usize,
}

/// 交叉熵损失（用于分类）
///
/// ```text
/// p = softmax(logits)
/// L = -log(p[target] + ε)
/// ∂L/∂logits = p - onehot(target)
/// ```
///
/// forward 缓存概率行和目标类别，backward 消费该缓存；
/// 没有先调用 forward 时 backward 返回 `MissingCache`。
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    cache: Option<CrossEntropyCache>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// 计算损失值
    ///
    /// # 参数
    /// - `logits`: [1, n_classes]
    /// - `target`: 真实类别索引
    pub fn forward(&mut self, logits: &Matrix, target: usize) -> Result<f64> {
        let loss = Self::compute(logits, target)?;
        self.cache = Some(CrossEntropyCache {
            probabilities: logits.softmax_rows(),
            target,
        });
        Ok(loss)
    }

    /// 不缓存的损失计算（评估用）
    pub fn compute(logits: &Matrix, target: usize) -> Result<f64> {
        if logits.nrows() != 1 {
            return Err(ModelError::ShapeMismatch(format!(
                "cross-entropy expects a single logit row, got {} rows",
                logits.nrows()
            )));
        }
        if target >= logits.ncols() {
            return Err(ModelError::InvalidClass {
                class: target,
                n_classes: logits.ncols(),
            });
        }

        let probabilities = logits.softmax_rows();
        Ok(-(probabilities[[0, target]] + LOG_EPS).ln())
    }

    /// 关于 logits 的梯度
    pub fn backward(&mut self) -> Result<Matrix> {
        let CrossEntropyCache {
            mut probabilities,
            target,
        } = self
            .cache
            .take()
            .ok_or(ModelError::MissingCache("cross-entropy loss"))?;

        probabilities[[0, target]] -= 1.0;
        Ok(probabilities)
    }

    pub fn name(&self) -> &str {
        "CrossEntropyLoss"
    }
}

/// 分类准确率
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Accuracy {
    pub fn new() -> Self {
        Self
    }

    /// 计算分类准确率
    ///
    /// # 参数
    /// - `predictions`: [n_samples, n_classes] 预测 logits（或概率）
    /// - `targets`: [n_samples] 真实类别索引
    pub fn compute(&self, predictions: &Matrix, targets: &[usize]) -> Result<f64> {
        if predictions.nrows() != targets.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "{} prediction rows for {} targets",
                predictions.nrows(),
                targets.len()
            )));
        }
        if targets.is_empty() {
            return Ok(0.0);
        }

        let correct = targets
            .iter()
            .enumerate()
            .filter(|&(i, &target)| predictions.argmax_row(i) == target)
            .count();

        Ok(correct as f64 / targets.len() as f64)
    }

    pub fn name(&self) -> &str {
        "Accuracy"
    }
}
