//! 嵌入层和位置编码
//!
//! 将离散的 token ID 转换为连续的向量表示，并添加位置信息。

use rand::Rng;

use crate::error::{ModelError, Result};
use crate::tensor::{Matrix, TensorExt};
use crate::trainable::{ForwardResult, Parameterized};

/// 保留的未知 token ID，越界 ID 一律映射到这一行
pub const UNK_ID: usize = 1;

/// 嵌入层的缓存：本次 forward 使用的（已替换越界 ID 的）行号
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    pub rows: Vec<usize>,
}

/// 词嵌入表
///
/// 将 token ID 映射到 d_model 维向量
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    /// 权重矩阵: [vocab_size, d_model]
    weights: Matrix,
    /// 梯度累加器: [vocab_size, d_model]
    grad_weights: Matrix,
    vocab_size: usize,
    d_model: usize,
}

impl EmbeddingTable {
    /// 创建新的嵌入层
    ///
    /// # 参数
    /// - `vocab_size`: 词表大小（至少包含 UNK 行）
    /// - `d_model`: 嵌入维度
    /// - `init_range`: 均匀初始化的半宽
    pub fn new<R: Rng>(
        vocab_size: usize,
        d_model: usize,
        init_range: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if vocab_size <= UNK_ID {
            return Err(ModelError::InvalidConfig(format!(
                "vocab_size must exceed the reserved unknown id {}, got {}",
                UNK_ID, vocab_size
            )));
        }

        Ok(Self {
            weights: Matrix::random_uniform((vocab_size, d_model), init_range, rng),
            grad_weights: Matrix::zeros((vocab_size, d_model)),
            vocab_size,
            d_model,
        })
    }

    fn row_for(&self, token_id: usize) -> usize {
        if token_id < self.vocab_size {
            token_id
        } else {
            UNK_ID
        }
    }

    /// 查表（推理用，不产生缓存）
    pub fn lookup(&self, sequence: &[usize]) -> Matrix {
        let mut embedded = Matrix::zeros((sequence.len(), self.d_model));
        for (i, &token_id) in sequence.iter().enumerate() {
            embedded
                .row_mut(i)
                .assign(&self.weights.row(self.row_for(token_id)));
        }
        embedded
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `sequence`: [seq_len] token IDs
    ///
    /// # 输出
    /// - [seq_len, d_model]
    pub fn forward(&self, sequence: &[usize]) -> ForwardResult<EmbeddingCache> {
        let rows = sequence.iter().map(|&t| self.row_for(t)).collect();
        ForwardResult::new(self.lookup(sequence), EmbeddingCache { rows })
    }

    /// 反向传播
    ///
    /// 每个位置的梯度行累加到对应的表行上；同一 token 出现多次时梯度求和。
    pub fn backward(&mut self, grad_output: &Matrix, cache: EmbeddingCache) -> Result<()> {
        if grad_output.dim() != (cache.rows.len(), self.d_model) {
            return Err(ModelError::shape(
                "embedding gradient",
                (cache.rows.len(), self.d_model),
                grad_output.dim(),
            ));
        }

        for (i, &row) in cache.rows.iter().enumerate() {
            let mut target = self.grad_weights.row_mut(row);
            target += &grad_output.row(i);
        }
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// 获取权重（用于可视化或保存）
    pub fn weights(&self) -> &Matrix {
        &self.weights
    }
}

impl Parameterized for EmbeddingTable {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.weights]
    }

    fn gradients(&self) -> Vec<&Matrix> {
        vec![&self.grad_weights]
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        (vec![&mut self.weights], vec![&self.grad_weights])
    }

    fn zero_grad(&mut self) {
        self.grad_weights.fill(0.0);
    }
}

/// 位置编码
///
/// 为输入序列添加位置信息，使用正弦和余弦函数。不可训练，没有反向传播。
///
/// 位置编码公式：
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d_model))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d_model))
/// ```
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_seq_len, d_model]
    pe: Matrix,
    max_seq_len: usize,
    d_model: usize,
}

impl PositionalEncoding {
    /// 创建新的位置编码
    ///
    /// # 参数
    /// - `max_seq_len`: 最大序列长度
    /// - `d_model`: 嵌入维度
    pub fn new(max_seq_len: usize, d_model: usize) -> Self {
        let mut pe = Matrix::zeros((max_seq_len, d_model));

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                // 分母: 10000^(2j/d_model)，其中 i = 2j
                let angle = pos as f64 / 10000f64.powf(i as f64 / d_model as f64);

                pe[[pos, i]] = angle.sin();
                if i + 1 < d_model {
                    pe[[pos, i + 1]] = angle.cos();
                }
            }
        }

        Self {
            pe,
            max_seq_len,
            d_model,
        }
    }

    /// 将前 seq_len 行位置编码逐元素加到输入上
    ///
    /// # 输入
    /// - `x`: [seq_len, d_model] 嵌入向量
    pub fn add_positional_encoding(&self, x: &Matrix) -> Result<Matrix> {
        let seq_len = x.nrows();
        if seq_len > self.max_seq_len || x.ncols() != self.d_model {
            return Err(ModelError::ShapeMismatch(format!(
                "positional encoding supports up to {}x{}, got {}x{}",
                self.max_seq_len,
                self.d_model,
                seq_len,
                x.ncols()
            )));
        }

        let pe_slice = self.pe.slice(ndarray::s![..seq_len, ..]);
        Ok(x + &pe_slice)
    }

    /// 获取位置编码（用于可视化）
    pub fn encoding(&self) -> &Matrix {
        &self.pe
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}
