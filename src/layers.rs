//! Transformer 的基础层
//!
//! 包含 Layer Normalization 和 Feed-Forward Network

use ndarray::Axis;
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::tensor::{ensure_shape, Matrix, TensorExt};
use crate::trainable::{ForwardResult, Layer, Parameterized};

/// Layer Norm 的默认 ε
pub const DEFAULT_LAYER_NORM_EPS: f64 = 1e-6;

/// Layer Norm 的缓存（每行一个均值与 1/σ）
#[derive(Debug, Clone)]
pub struct LayerNormCache {
    pub input: Matrix,
    /// [seq_len, 1]
    pub mean: Matrix,
    /// [seq_len, 1]
    pub inv_std: Matrix,
    /// 仿射变换之前的归一化值 [seq_len, d_model]
    pub normalized: Matrix,
}

/// Layer Normalization
///
/// 对每个位置的所有特征进行归一化，使均值为 0，方差为 1。
///
/// ```text
/// y = γ * ((x - μ) / √(σ² + ε)) + β
/// ```
///
/// 方差为有偏估计（除以 d_model）。
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// 缩放参数 γ [1, d_model]
    gamma: Matrix,
    /// 平移参数 β [1, d_model]
    beta: Matrix,
    grad_gamma: Matrix,
    grad_beta: Matrix,
    /// 防止除零的小常数
    eps: f64,
    d_model: usize,
}

impl LayerNorm {
    /// 创建新的 Layer Norm 层
    ///
    /// # 参数
    /// - `d_model`: 特征维度
    /// - `eps`: 防止除零的小常数（默认 1e-6）
    pub fn new(d_model: usize, eps: Option<f64>) -> Self {
        // γ 初始化为 1，β 初始化为 0
        Self {
            gamma: Matrix::ones((1, d_model)),
            beta: Matrix::zeros((1, d_model)),
            grad_gamma: Matrix::zeros((1, d_model)),
            grad_beta: Matrix::zeros((1, d_model)),
            eps: eps.unwrap_or(DEFAULT_LAYER_NORM_EPS),
            d_model,
        }
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }
}

impl Layer for LayerNorm {
    type Cache = LayerNormCache;

    /// 前向传播
    ///
    /// # 输入
    /// - `x`: [seq_len, d_model]
    ///
    /// # 输出
    /// - [seq_len, d_model] 归一化后的值
    fn forward(&self, x: &Matrix) -> Result<ForwardResult<LayerNormCache>> {
        if x.ncols() != self.d_model {
            return Err(ModelError::shape(
                "layer norm input",
                (x.nrows(), self.d_model),
                x.dim(),
            ));
        }

        let n = self.d_model as f64;
        let mean = x.sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
        let centered = x - &mean;
        let variance = centered
            .mapv(|v| v * v)
            .sum_axis(Axis(1))
            .insert_axis(Axis(1))
            / n;
        let inv_std = variance.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let normalized = &centered * &inv_std;

        let output = &normalized * &self.gamma + &self.beta;

        Ok(ForwardResult::new(
            output,
            LayerNormCache {
                input: x.clone(),
                mean,
                inv_std,
                normalized,
            },
        ))
    }

    /// 反向传播
    ///
    /// 记 `g = dy ⊙ γ`，x̂ 为归一化值，则每行：
    ///
    /// ```text
    /// dx = (1/σ) · (g − mean(g) − x̂ · mean(g ⊙ x̂))
    /// ```
    ///
    /// 三项分别对应直接路径、经由均值的路径、经由方差的路径。
    fn backward(&mut self, grad_output: &Matrix, cache: LayerNormCache) -> Result<Matrix> {
        ensure_shape("layer norm gradient", grad_output, cache.normalized.dim())?;

        let LayerNormCache {
            inv_std,
            normalized,
            ..
        } = cache;

        self.grad_gamma += &(grad_output * &normalized).column_sums();
        self.grad_beta += &grad_output.column_sums();

        let n = self.d_model as f64;
        let g = grad_output * &self.gamma;
        let mean_g = g.sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
        let mean_gx = (&g * &normalized)
            .sum_axis(Axis(1))
            .insert_axis(Axis(1))
            / n;

        let grad_input = (&g - &mean_g - &normalized * &mean_gx) * &inv_std;
        Ok(grad_input)
    }
}

impl Parameterized for LayerNorm {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.gamma, &self.beta]
    }

    fn gradients(&self) -> Vec<&Matrix> {
        vec![&self.grad_gamma, &self.grad_beta]
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        (
            vec![&mut self.gamma, &mut self.beta],
            vec![&self.grad_gamma, &self.grad_beta],
        )
    }

    fn zero_grad(&mut self) {
        self.grad_gamma.fill(0.0);
        self.grad_beta.fill(0.0);
    }
}

/// Feed-Forward Network 的缓存
#[derive(Debug, Clone)]
pub struct FeedForwardCache {
    pub input: Matrix,
    /// 激活前 xW1 + b1
    pub hidden: Matrix,
    /// ReLU 之后
    pub activated: Matrix,
}

/// Feed-Forward Network
///
/// 两层全连接网络，中间使用 ReLU 激活函数。
///
/// ```text
/// FFN(x) = ReLU(xW1 + b1)W2 + b2
/// ```
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// 第一层权重: [d_model, d_ff]
    w1: Matrix,
    /// 第二层权重: [d_ff, d_model]
    w2: Matrix,
    /// 第一层偏置: [1, d_ff]
    b1: Matrix,
    /// 第二层偏置: [1, d_model]
    b2: Matrix,
    grad_w1: Matrix,
    grad_w2: Matrix,
    grad_b1: Matrix,
    grad_b2: Matrix,
    d_model: usize,
    d_ff: usize,
}

impl FeedForward {
    /// 创建新的 Feed-Forward Network
    ///
    /// # 参数
    /// - `d_model`: 输入/输出维度
    /// - `d_ff`: 隐藏层维度
    /// - `init_range`: 权重均匀初始化的半宽，偏置初始化为 0
    pub fn new<R: Rng>(d_model: usize, d_ff: usize, init_range: f64, rng: &mut R) -> Self {
        Self {
            w1: Matrix::random_uniform((d_model, d_ff), init_range, rng),
            w2: Matrix::random_uniform((d_ff, d_model), init_range, rng),
            b1: Matrix::zeros((1, d_ff)),
            b2: Matrix::zeros((1, d_model)),
            grad_w1: Matrix::zeros((d_model, d_ff)),
            grad_w2: Matrix::zeros((d_ff, d_model)),
            grad_b1: Matrix::zeros((1, d_ff)),
            grad_b2: Matrix::zeros((1, d_model)),
            d_model,
            d_ff,
        }
    }

    /// 获取维度
    pub fn dimensions(&self) -> (usize, usize) {
        (self.d_model, self.d_ff)
    }
}

impl Layer for FeedForward {
    type Cache = FeedForwardCache;

    fn forward(&self, x: &Matrix) -> Result<ForwardResult<FeedForwardCache>> {
        if x.ncols() != self.d_model {
            return Err(ModelError::shape(
                "feed-forward input",
                (x.nrows(), self.d_model),
                x.dim(),
            ));
        }

        let hidden = x.dot(&self.w1) + &self.b1;
        let activated = hidden.mapv(|v| v.max(0.0));
        let output = activated.dot(&self.w2) + &self.b2;

        Ok(ForwardResult::new(
            output,
            FeedForwardCache {
                input: x.clone(),
                hidden,
                activated,
            },
        ))
    }

    fn backward(&mut self, grad_output: &Matrix, cache: FeedForwardCache) -> Result<Matrix> {
        ensure_shape(
            "feed-forward gradient",
            grad_output,
            (cache.input.nrows(), self.d_model),
        )?;

        self.grad_w2 += &cache.activated.t().dot(grad_output);
        self.grad_b2 += &grad_output.column_sums();

        // ReLU 反向：激活前 ≤ 0 的位置梯度为 0
        let mut grad_hidden = grad_output.dot(&self.w2.t());
        grad_hidden.zip_mut_with(&cache.hidden, |g, &h| {
            if h <= 0.0 {
                *g = 0.0;
            }
        });

        self.grad_w1 += &cache.input.t().dot(&grad_hidden);
        self.grad_b1 += &grad_hidden.column_sums();

        Ok(grad_hidden.dot(&self.w1.t()))
    }
}

impl Parameterized for FeedForward {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.w1, &self.w2, &self.b1, &self.b2]
    }

    fn gradients(&self) -> Vec<&Matrix> {
        vec![&self.grad_w1, &self.grad_w2, &self.grad_b1, &self.grad_b2]
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        (
            vec![&mut self.w1, &mut self.w2, &mut self.b1, &mut self.b2],
            vec![&self.grad_w1, &self.grad_w2, &self.grad_b1, &self.grad_b2],
        )
    }

    fn zero_grad(&mut self) {
        self.grad_w1.fill(0.0);
        self.grad_w2.fill(0.0);
        self.grad_b1.fill(0.0);
        self.grad_b2.fill(0.0);
    }
}
