//! Multi-Head Self-Attention
//!
//! Transformer 的核心组件：允许模型关注输入序列的不同位置。
//!
//! ```text
//! Input → [Head₁ … Headₙ] (各自独立的 Q/K/V 投影) →
//!     Concat Heads → Linear(W_o) → Output
//! ```

use ndarray::Axis;
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::tensor::{Matrix, TensorExt};
use crate::trainable::{ForwardResult, MaskedLayer, Parameterized};

/// 被掩码位置的分数偏置，softmax 后权重近似为 0
pub const MASK_VALUE: f64 = -1e9;

/// 单头注意力的缓存
#[derive(Debug, Clone)]
pub struct SelfAttentionCache {
    pub input: Matrix,
    pub q: Matrix,
    pub k: Matrix,
    pub v: Matrix,
    /// softmax 之后的注意力权重 [seq_len, seq_len]
    pub weights: Matrix,
}

/// 单个注意力头
///
/// ```text
/// Attention(Q, K, V) = softmax(QKᵀ / √d_k + mask) · V
/// ```
#[derive(Debug, Clone)]
pub struct SelfAttention {
    /// Query 投影: [d_model, head_dim]
    w_q: Matrix,
    /// Key 投影: [d_model, head_dim]
    w_k: Matrix,
    /// Value 投影: [d_model, head_dim]
    w_v: Matrix,
    grad_w_q: Matrix,
    grad_w_k: Matrix,
    grad_w_v: Matrix,
    d_model: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn new<R: Rng>(d_model: usize, head_dim: usize, init_range: f64, rng: &mut R) -> Self {
        let shape = (d_model, head_dim);
        Self {
            w_q: Matrix::random_uniform(shape, init_range, rng),
            w_k: Matrix::random_uniform(shape, init_range, rng),
            w_v: Matrix::random_uniform(shape, init_range, rng),
            grad_w_q: Matrix::zeros(shape),
            grad_w_k: Matrix::zeros(shape),
            grad_w_v: Matrix::zeros(shape),
            d_model,
            head_dim,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn scale(&self) -> f64 {
        (self.head_dim as f64).sqrt()
    }
}

fn check_input(what: &str, input: &Matrix, mask: &[u8], d_model: usize) -> Result<()> {
    if input.ncols() != d_model {
        return Err(ModelError::ShapeMismatch(format!(
            "{}: expected {} input columns, got {}",
            what,
            d_model,
            input.ncols()
        )));
    }
    if mask.len() != input.nrows() {
        return Err(ModelError::ShapeMismatch(format!(
            "{}: mask length {} does not match sequence length {}",
            what,
            mask.len(),
            input.nrows()
        )));
    }
    Ok(())
}

impl MaskedLayer for SelfAttention {
    type Cache = SelfAttentionCache;

    fn forward(&self, input: &Matrix, mask: &[u8]) -> Result<ForwardResult<SelfAttentionCache>> {
        check_input("self-attention", input, mask, self.d_model)?;

        let q = input.dot(&self.w_q);
        let k = input.dot(&self.w_k);
        let v = input.dot(&self.w_v);

        // 缩放点积分数: Q · Kᵀ / √d_k
        let mut scores = q.dot(&k.t()) / self.scale();

        // 被掩码的列（PAD 位置）对所有查询行都加上大负数
        for (j, &m) in mask.iter().enumerate() {
            if m == 0 {
                scores.column_mut(j).mapv_inplace(|s| s + MASK_VALUE);
            }
        }

        let weights = scores.softmax_rows();
        let output = weights.dot(&v);

        Ok(ForwardResult::new(
            output,
            SelfAttentionCache {
                input: input.clone(),
                q,
                k,
                v,
                weights,
            },
        ))
    }

    fn backward(&mut self, grad_output: &Matrix, cache: SelfAttentionCache) -> Result<Matrix> {
        let seq_len = cache.input.nrows();
        if grad_output.dim() != (seq_len, self.head_dim) {
            return Err(ModelError::shape(
                "self-attention gradient",
                (seq_len, self.head_dim),
                grad_output.dim(),
            ));
        }

        let SelfAttentionCache {
            input,
            q,
            k,
            v,
            weights,
        } = cache;

        // output = W · V
        let grad_v = weights.t().dot(grad_output);
        let grad_weights = grad_output.dot(&v.t());

        // softmax 反向: dS_j = w_j · (dW_j − Σ_k w_k · dW_k)，逐行
        let row_dot = (&weights * &grad_weights)
            .sum_axis(Axis(1))
            .insert_axis(Axis(1));
        let grad_scores = &weights * &(&grad_weights - &row_dot) / self.scale();

        let grad_q = grad_scores.dot(&k);
        let grad_k = grad_scores.t().dot(&q);

        let input_t = input.t();
        self.grad_w_q += &input_t.dot(&grad_q);
        self.grad_w_k += &input_t.dot(&grad_k);
        self.grad_w_v += &input_t.dot(&grad_v);

        let grad_input = grad_q.dot(&self.w_q.t())
            + grad_k.dot(&self.w_k.t())
            + grad_v.dot(&self.w_v.t());

        Ok(grad_input)
    }
}

impl Parameterized for SelfAttention {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.w_q, &self.w_k, &self.w_v]
    }

    fn gradients(&self) -> Vec<&Matrix> {
        vec![&self.grad_w_q, &self.grad_w_k, &self.grad_w_v]
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        (
            vec![&mut self.w_q, &mut self.w_k, &mut self.w_v],
            vec![&self.grad_w_q, &self.grad_w_k, &self.grad_w_v],
        )
    }

    fn zero_grad(&mut self) {
        self.grad_w_q.fill(0.0);
        self.grad_w_k.fill(0.0);
        self.grad_w_v.fill(0.0);
    }
}

/// 多头注意力的缓存
#[derive(Debug, Clone)]
pub struct MultiHeadAttentionCache {
    /// 各头输出按列拼接 [seq_len, d_model]
    pub concatenated: Matrix,
    pub head_caches: Vec<SelfAttentionCache>,
}

/// Multi-Head Self-Attention 层
///
/// 所有头读取同一输入，输出按头的顺序按列拼接后乘以输出投影。
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    heads: Vec<SelfAttention>,
    /// 输出投影: [d_model, d_model]
    w_o: Matrix,
    grad_w_o: Matrix,
    d_model: usize,
}

impl MultiHeadAttention {
    /// 创建新的 Multi-Head Attention 层
    ///
    /// # 参数
    /// - `d_model`: 模型维度
    /// - `n_heads`: 注意力头数，必须整除 `d_model`
    pub fn new<R: Rng>(
        d_model: usize,
        n_heads: usize,
        init_range: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if n_heads == 0 || d_model % n_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                d_model, n_heads
            )));
        }

        let head_dim = d_model / n_heads;
        let heads = (0..n_heads)
            .map(|_| SelfAttention::new(d_model, head_dim, init_range, rng))
            .collect();

        Ok(Self {
            heads,
            w_o: Matrix::random_uniform((d_model, d_model), init_range, rng),
            grad_w_o: Matrix::zeros((d_model, d_model)),
            d_model,
        })
    }

    pub fn n_heads(&self) -> usize {
        self.heads.len()
    }

    /// 每个头的注意力权重（用于可视化）
    pub fn attention_weights(&self, input: &Matrix, mask: &[u8]) -> Result<Vec<Matrix>> {
        self.heads
            .iter()
            .map(|head| head.forward(input, mask).map(|r| r.cache.weights))
            .collect()
    }
}

impl MaskedLayer for MultiHeadAttention {
    type Cache = MultiHeadAttentionCache;

    fn forward(
        &self,
        input: &Matrix,
        mask: &[u8],
    ) -> Result<ForwardResult<MultiHeadAttentionCache>> {
        check_input("multi-head attention", input, mask, self.d_model)?;

        let mut outputs = Vec::with_capacity(self.heads.len());
        let mut head_caches = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            let result = head.forward(input, mask)?;
            outputs.push(result.output);
            head_caches.push(result.cache);
        }

        let concatenated = Matrix::hconcat(&outputs)?;
        let output = concatenated.dot(&self.w_o);

        Ok(ForwardResult::new(
            output,
            MultiHeadAttentionCache {
                concatenated,
                head_caches,
            },
        ))
    }

    fn backward(
        &mut self,
        grad_output: &Matrix,
        cache: MultiHeadAttentionCache,
    ) -> Result<Matrix> {
        let seq_len = cache.concatenated.nrows();
        if grad_output.dim() != (seq_len, self.d_model) {
            return Err(ModelError::shape(
                "multi-head attention gradient",
                (seq_len, self.d_model),
                grad_output.dim(),
            ));
        }
        if cache.head_caches.len() != self.heads.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "cache holds {} heads, layer has {}",
                cache.head_caches.len(),
                self.heads.len()
            )));
        }

        self.grad_w_o += &cache.concatenated.t().dot(grad_output);
        let grad_concat = grad_output.dot(&self.w_o.t());
        let head_grads = grad_concat.split_columns(self.heads.len())?;

        let mut grad_input = Matrix::zeros((seq_len, self.d_model));
        for ((head, grad), head_cache) in self
            .heads
            .iter_mut()
            .zip(head_grads.iter())
            .zip(cache.head_caches)
        {
            grad_input += &head.backward(grad, head_cache)?;
        }

        Ok(grad_input)
    }
}

impl Parameterized for MultiHeadAttention {
    fn parameters(&self) -> Vec<&Matrix> {
        let mut params = vec![&self.w_o];
        for head in &self.heads {
            params.extend(head.parameters());
        }
        params
    }

    fn gradients(&self) -> Vec<&Matrix> {
        let mut grads = vec![&self.grad_w_o];
        for head in &self.heads {
            grads.extend(head.gradients());
        }
        grads
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        let mut params = vec![&mut self.w_o];
        let mut grads = vec![&self.grad_w_o];
        for head in self.heads.iter_mut() {
            let (p, g) = head.parameters_and_gradients();
            params.extend(p);
            grads.extend(g);
        }
        (params, grads)
    }

    fn zero_grad(&mut self) {
        self.grad_w_o.fill(0.0);
        for head in self.heads.iter_mut() {
            head.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck;
    use crate::tensor::init_rng;
    use approx::assert_abs_diff_eq;

    fn input(rows: usize, cols: usize, seed: u64) -> Matrix {
        Matrix::random_uniform((rows, cols), 1.0, &mut init_rng(Some(seed)))
    }

    #[test]
    fn test_invalid_head_count() {
        let err = MultiHeadAttention::new(10, 3, 0.1, &mut init_rng(Some(1)));
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_multi_head_attention_shapes() {
        let attention = MultiHeadAttention::new(8, 2, 0.1, &mut init_rng(Some(1))).unwrap();
        let x = input(5, 8, 2);
        let result = attention.forward(&x, &[1, 1, 1, 1, 1]).unwrap();

        assert_eq!(result.output.shape(), &[5, 8]);
        assert_eq!(result.cache.head_caches.len(), 2);
        assert_eq!(result.cache.concatenated.shape(), &[5, 8]);
        assert_eq!(attention.parameters().len(), 1 + 2 * 3);
    }

    #[test]
    fn test_attention_weights_rows_sum_to_one() {
        let attention = MultiHeadAttention::new(8, 4, 0.5, &mut init_rng(Some(4))).unwrap();
        let x = input(6, 8, 5);
        for weights in attention.attention_weights(&x, &[1; 6]).unwrap() {
            assert_eq!(weights.shape(), &[6, 6]);
            for row in weights.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_masked_columns_get_no_attention() {
        let head = SelfAttention::new(4, 2, 0.5, &mut init_rng(Some(6)));
        let x = input(5, 4, 7);
        let mask = [1, 1, 1, 0, 0];
        let weights = head.forward(&x, &mask).unwrap().cache.weights;

        for i in 0..5 {
            assert!(weights[[i, 3]] < 1e-12);
            assert!(weights[[i, 4]] < 1e-12);
            let visible: f64 = (0..3).map(|j| weights[[i, j]]).sum();
            assert_abs_diff_eq!(visible, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_mask_length_checked() {
        let head = SelfAttention::new(4, 2, 0.1, &mut init_rng(Some(6)));
        let x = input(5, 4, 7);
        assert!(head.forward(&x, &[1, 1]).is_err());
    }

    #[test]
    fn test_self_attention_gradients() {
        let mut head = SelfAttention::new(4, 2, 0.5, &mut init_rng(Some(8)));
        let x = input(4, 4, 9);
        let mask = [1, 1, 1, 0];
        gradcheck::check_masked_layer(&mut head, &x, &mask);
    }

    #[test]
    fn test_multi_head_attention_gradients() {
        let mut attention = MultiHeadAttention::new(4, 2, 0.5, &mut init_rng(Some(10))).unwrap();
        let x = input(3, 4, 11);
        let mask = [1, 1, 0];
        gradcheck::check_masked_layer(&mut attention, &x, &mask);
    }
}
