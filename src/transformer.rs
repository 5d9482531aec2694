//! 完整的 Transformer Encoder 分类模型
//!
//! 组合所有组件，构建可训练的代码片段分类器。
//!
//! ```text
//! Input → Embedding → Positional Encoding →
//!     [Encoder Block × N] → 取第 0 行 (pooled) → Classification Head → logits
//! ```

use ndarray::s;
use serde::{Deserialize, Serialize};

use crate::attention::{MultiHeadAttention, MultiHeadAttentionCache};
use crate::embedding::{EmbeddingCache, EmbeddingTable, PositionalEncoding};
use crate::error::{ModelError, Result};
use crate::layers::{
    FeedForward, FeedForwardCache, LayerNorm, LayerNormCache, DEFAULT_LAYER_NORM_EPS,
};
use crate::tensor::{ensure_shape, init_rng, Matrix, TensorExt};
use crate::trainable::{
    collect_parameters_and_gradients, ForwardResult, Layer, MaskedLayer, Parameterized,
};

fn default_init_range() -> f64 {
    0.1
}

fn default_layer_norm_eps() -> f64 {
    DEFAULT_LAYER_NORM_EPS
}

/// Transformer 配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// 词表大小（包含保留 token）
    pub vocab_size: usize,
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// FFN 隐藏层维度
    pub d_ff: usize,
    /// Encoder 层数
    pub n_layers: usize,
    /// 分类类别数
    pub n_classes: usize,
    /// 最大序列长度
    pub max_seq_len: usize,
    /// 均匀初始化的半宽
    #[serde(default = "default_init_range")]
    pub init_range: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// 随机种子；None 时使用系统熵
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10000,
            d_model: 64,
            n_heads: 8,
            d_ff: 256,
            n_layers: 3,
            n_classes: 8,
            max_seq_len: 100,
            init_range: default_init_range(),
            layer_norm_eps: DEFAULT_LAYER_NORM_EPS,
            seed: None,
        }
    }
}

impl TransformerConfig {
    /// 每个头的维度
    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads.max(1)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("d_model", self.d_model),
            ("n_heads", self.n_heads),
            ("d_ff", self.d_ff),
            ("n_layers", self.n_layers),
            ("n_classes", self.n_classes),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ModelError::InvalidConfig(format!("{} must be positive", name)));
        }
        if self.vocab_size < 2 {
            return Err(ModelError::InvalidConfig(format!(
                "vocab_size must be at least 2, got {}",
                self.vocab_size
            )));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        if !self.init_range.is_finite() || self.init_range < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "init_range must be a non-negative number, got {}",
                self.init_range
            )));
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }
}

/// Encoder Block 的缓存
#[derive(Debug, Clone)]
pub struct EncoderBlockCache {
    pub attention: MultiHeadAttentionCache,
    pub norm1: LayerNormCache,
    pub feed_forward: FeedForwardCache,
    pub norm2: LayerNormCache,
}

/// 单个 Transformer Encoder 层
///
/// 包含两个子层，每个子层都有残差连接和层归一化（Post-LN）：
///
/// ```text
/// n1 = LayerNorm(x + Attention(x, mask))
/// n2 = LayerNorm(n1 + FFN(n1))
/// ```
#[derive(Debug, Clone)]
pub struct EncoderBlock {
    attention: MultiHeadAttention,
    norm1: LayerNorm,
    feed_forward: FeedForward,
    norm2: LayerNorm,
}

impl EncoderBlock {
    pub fn new<R: rand::Rng>(config: &TransformerConfig, rng: &mut R) -> Result<Self> {
        let attention =
            MultiHeadAttention::new(config.d_model, config.n_heads, config.init_range, rng)?;
        let norm1 = LayerNorm::new(config.d_model, Some(config.layer_norm_eps));
        let feed_forward = FeedForward::new(config.d_model, config.d_ff, config.init_range, rng);
        let norm2 = LayerNorm::new(config.d_model, Some(config.layer_norm_eps));

        Ok(Self {
            attention,
            norm1,
            feed_forward,
            norm2,
        })
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }
}

impl MaskedLayer for EncoderBlock {
    type Cache = EncoderBlockCache;

    fn forward(&self, x: &Matrix, mask: &[u8]) -> Result<ForwardResult<EncoderBlockCache>> {
        let attention = self.attention.forward(x, mask)?;
        let norm1 = self.norm1.forward(&(x + &attention.output))?;
        let feed_forward = self.feed_forward.forward(&norm1.output)?;
        let norm2 = self.norm2.forward(&(&norm1.output + &feed_forward.output))?;

        Ok(ForwardResult::new(
            norm2.output,
            EncoderBlockCache {
                attention: attention.cache,
                norm1: norm1.cache,
                feed_forward: feed_forward.cache,
                norm2: norm2.cache,
            },
        ))
    }

    /// 反向传播
    ///
    /// 残差和的梯度原样复制到两个分支，分支汇合处梯度相加。
    fn backward(&mut self, grad_output: &Matrix, cache: EncoderBlockCache) -> Result<Matrix> {
        let grad_sum2 = self.norm2.backward(grad_output, cache.norm2)?;
        let grad_n1 = &grad_sum2 + &self.feed_forward.backward(&grad_sum2, cache.feed_forward)?;

        let grad_sum1 = self.norm1.backward(&grad_n1, cache.norm1)?;
        let grad_x = &grad_sum1 + &self.attention.backward(&grad_sum1, cache.attention)?;

        Ok(grad_x)
    }
}

impl Parameterized for EncoderBlock {
    fn parameters(&self) -> Vec<&Matrix> {
        let mut params = self.attention.parameters();
        params.extend(self.norm1.parameters());
        params.extend(self.feed_forward.parameters());
        params.extend(self.norm2.parameters());
        params
    }

    fn gradients(&self) -> Vec<&Matrix> {
        let mut grads = self.attention.gradients();
        grads.extend(self.norm1.gradients());
        grads.extend(self.feed_forward.gradients());
        grads.extend(self.norm2.gradients());
        grads
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        collect_parameters_and_gradients(vec![
            &mut self.attention as &mut dyn Parameterized,
            &mut self.norm1,
            &mut self.feed_forward,
            &mut self.norm2,
        ])
    }

    fn zero_grad(&mut self) {
        self.attention.zero_grad();
        self.norm1.zero_grad();
        self.feed_forward.zero_grad();
        self.norm2.zero_grad();
    }
}

/// 分类头的缓存
#[derive(Debug, Clone)]
pub struct ClassificationHeadCache {
    /// pooled 行向量 [1, d_model]
    pub input: Matrix,
}

/// 分类头
///
/// ```text
/// logits = pooled · W + b
/// ```
#[derive(Debug, Clone)]
pub struct ClassificationHead {
    /// [d_model, n_classes]
    w: Matrix,
    /// [1, n_classes]，初始化为 0
    b: Matrix,
    grad_w: Matrix,
    grad_b: Matrix,
}

impl ClassificationHead {
    pub fn new<R: rand::Rng>(
        d_model: usize,
        n_classes: usize,
        init_range: f64,
        rng: &mut R,
    ) -> Self {
        Self {
            w: Matrix::random_uniform((d_model, n_classes), init_range, rng),
            b: Matrix::zeros((1, n_classes)),
            grad_w: Matrix::zeros((d_model, n_classes)),
            grad_b: Matrix::zeros((1, n_classes)),
        }
    }

    pub fn n_classes(&self) -> usize {
        self.w.ncols()
    }
}

impl Layer for ClassificationHead {
    type Cache = ClassificationHeadCache;

    fn forward(&self, input: &Matrix) -> Result<ForwardResult<ClassificationHeadCache>> {
        if input.nrows() != 1 {
            return Err(ModelError::ShapeMismatch(format!(
                "classification head expects a single row, got {} rows",
                input.nrows()
            )));
        }
        let logits = input.matmul(&self.w)? + &self.b;

        Ok(ForwardResult::new(
            logits,
            ClassificationHeadCache {
                input: input.clone(),
            },
        ))
    }

    fn backward(
        &mut self,
        grad_output: &Matrix,
        cache: ClassificationHeadCache,
    ) -> Result<Matrix> {
        ensure_shape("classification head gradient", grad_output, self.b.dim())?;

        self.grad_w += &cache.input.t().dot(grad_output);
        self.grad_b += grad_output;

        Ok(grad_output.dot(&self.w.t()))
    }
}

impl Parameterized for ClassificationHead {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.w, &self.b]
    }

    fn gradients(&self) -> Vec<&Matrix> {
        vec![&self.grad_w, &self.grad_b]
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        (vec![&mut self.w, &mut self.b], vec![&self.grad_w, &self.grad_b])
    }

    fn zero_grad(&mut self) {
        self.grad_w.fill(0.0);
        self.grad_b.fill(0.0);
    }
}

/// 整个模型一次 forward 的缓存
#[derive(Debug, Clone)]
pub struct ModelCache {
    pub embedding: EmbeddingCache,
    pub blocks: Vec<EncoderBlockCache>,
    pub head: ClassificationHeadCache,
    /// 输入序列长度，决定反向时重建的梯度矩阵行数
    pub seq_len: usize,
}

/// 单个输入的预测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// argmax 类别
    pub class: usize,
    /// 该类别的 softmax 概率
    pub probability: f64,
    /// 所有类别的概率
    pub probabilities: Vec<f64>,
}

/// Transformer 分类模型
#[derive(Debug, Clone)]
pub struct TransformerModel {
    config: TransformerConfig,
    embedding: EmbeddingTable,
    positional: PositionalEncoding,
    blocks: Vec<EncoderBlock>,
    head: ClassificationHead,
}

impl TransformerModel {
    /// 创建新的模型
    ///
    /// 只创建一个随机数生成器，按构造顺序（嵌入、各 Encoder 层、分类头）依次传入。
    pub fn new(config: TransformerConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = init_rng(config.seed);

        let embedding =
            EmbeddingTable::new(config.vocab_size, config.d_model, config.init_range, &mut rng)?;
        let positional = PositionalEncoding::new(config.max_seq_len, config.d_model);
        let blocks = (0..config.n_layers)
            .map(|_| EncoderBlock::new(&config, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let head = ClassificationHead::new(
            config.d_model,
            config.n_classes,
            config.init_range,
            &mut rng,
        );

        Ok(Self {
            config,
            embedding,
            positional,
            blocks,
            head,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[EncoderBlock] {
        &self.blocks
    }

    pub fn embedding(&self) -> &EmbeddingTable {
        &self.embedding
    }

    fn check_input(&self, sequence: &[usize], mask: &[u8]) -> Result<()> {
        if sequence.is_empty() {
            return Err(ModelError::ShapeMismatch("empty input sequence".to_string()));
        }
        if sequence.len() != mask.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "sequence length {} does not match mask length {}",
                sequence.len(),
                mask.len()
            )));
        }
        if sequence.len() > self.config.max_seq_len {
            return Err(ModelError::ShapeMismatch(format!(
                "sequence length {} exceeds max_seq_len {}",
                sequence.len(),
                self.config.max_seq_len
            )));
        }
        Ok(())
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `sequence`: [seq_len] token IDs
    /// - `mask`: [seq_len]，0 表示 PAD
    ///
    /// # 输出
    /// - logits [1, n_classes] 以及反向传播所需的缓存
    pub fn forward(&self, sequence: &[usize], mask: &[u8]) -> Result<ForwardResult<ModelCache>> {
        self.check_input(sequence, mask)?;

        let embedded = self.embedding.forward(sequence);
        let mut x = self.positional.add_positional_encoding(&embedded.output)?;

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let result = block.forward(&x, mask)?;
            x = result.output;
            block_caches.push(result.cache);
        }

        // 第 0 行（SOS 位置）作为整段序列的表示
        let pooled = x.slice(s![0..1, ..]).to_owned();
        let head = self.head.forward(&pooled)?;

        Ok(ForwardResult::new(
            head.output,
            ModelCache {
                embedding: embedded.cache,
                blocks: block_caches,
                head: head.cache,
                seq_len: sequence.len(),
            },
        ))
    }

    /// 反向传播
    ///
    /// pooled 行的梯度放回一个 [seq_len, d_model] 零矩阵的第 0 行，
    /// 然后逆序经过各 Encoder 层，最后累加到嵌入表。位置编码是常量，没有梯度。
    pub fn backward(&mut self, grad_logits: &Matrix, cache: ModelCache) -> Result<()> {
        if cache.blocks.len() != self.blocks.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "cache holds {} blocks, model has {}",
                cache.blocks.len(),
                self.blocks.len()
            )));
        }

        let grad_pooled = self.head.backward(grad_logits, cache.head)?;

        let mut grad = Matrix::zeros((cache.seq_len, self.config.d_model));
        grad.row_mut(0).assign(&grad_pooled.row(0));

        for (block, block_cache) in self.blocks.iter_mut().rev().zip(cache.blocks.into_iter().rev())
        {
            grad = block.backward(&grad, block_cache)?;
        }

        self.embedding.backward(&grad, cache.embedding)
    }

    /// 预测：softmax 后取最大概率的类别
    pub fn predict(&self, sequence: &[usize], mask: &[u8]) -> Result<Prediction> {
        let logits = self.forward(sequence, mask)?.output;
        let probs = logits.softmax_rows();
        let class = probs.argmax_row(0);

        Ok(Prediction {
            class,
            probability: probs[[0, class]],
            probabilities: probs.row(0).to_vec(),
        })
    }
}

impl Parameterized for TransformerModel {
    fn parameters(&self) -> Vec<&Matrix> {
        let mut params = self.embedding.parameters();
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.head.parameters());
        params
    }

    fn gradients(&self) -> Vec<&Matrix> {
        let mut grads = self.embedding.gradients();
        for block in &self.blocks {
            grads.extend(block.gradients());
        }
        grads.extend(self.head.gradients());
        grads
    }

    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
        let mut parts: Vec<&mut dyn Parameterized> = vec![&mut self.embedding];
        for block in self.blocks.iter_mut() {
            parts.push(block);
        }
        parts.push(&mut self.head);
        collect_parameters_and_gradients(parts)
    }

    fn zero_grad(&mut self) {
        self.embedding.zero_grad();
        for block in self.blocks.iter_mut() {
            block.zero_grad();
        }
        self.head.zero_grad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck;
    use approx::assert_abs_diff_eq;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 8,
            d_model: 4,
            n_heads: 2,
            d_ff: 16,
            n_layers: 2,
            n_classes: 2,
            max_seq_len: 10,
            init_range: 0.1,
            layer_norm_eps: 1e-6,
            seed: Some(42),
        }
    }

    const SEQUENCE: [usize; 10] = [2, 4, 3, 0, 0, 0, 0, 0, 0, 0];
    const MASK: [u8; 10] = [1, 1, 1, 0, 0, 0, 0, 0, 0, 0];

    #[test]
    fn test_config_validation() {
        assert!(tiny_config().validate().is_ok());
        assert!(TransformerConfig::default().validate().is_ok());

        let bad_heads = TransformerConfig {
            n_heads: 3,
            ..tiny_config()
        };
        assert!(matches!(
            TransformerModel::new(bad_heads),
            Err(ModelError::InvalidConfig(_))
        ));

        let no_layers = TransformerConfig {
            n_layers: 0,
            ..tiny_config()
        };
        assert!(no_layers.validate().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let json = r#"{"vocab_size": 8, "d_model": 4, "n_heads": 2, "d_ff": 16,
                       "n_layers": 2, "n_classes": 2, "max_seq_len": 10}"#;
        let config: TransformerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.init_range, 0.1);
        assert_eq!(config.layer_norm_eps, 1e-6);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_forward_produces_one_logit_row() {
        let model = TransformerModel::new(tiny_config()).unwrap();
        let result = model.forward(&SEQUENCE, &MASK).unwrap();

        assert_eq!(result.output.shape(), &[1, 2]);
        assert_eq!(result.cache.blocks.len(), 2);
        assert_eq!(result.cache.seq_len, 10);
    }

    #[test]
    fn test_seeded_models_are_identical() {
        let a = TransformerModel::new(tiny_config()).unwrap();
        let b = TransformerModel::new(tiny_config()).unwrap();
        assert_eq!(a.parameters(), b.parameters());
    }

    #[test]
    fn test_parameter_layout() {
        let model = TransformerModel::new(tiny_config()).unwrap();
        let params = model.parameters();
        let grads = model.gradients();

        // 嵌入 + 每层 (W_o + 2 头 × 3 + LN 2 + FFN 4 + LN 2) + 分类头 2
        assert_eq!(params.len(), 1 + 2 * (1 + 6 + 2 + 4 + 2) + 2);
        assert_eq!(params.len(), grads.len());
        for (p, g) in params.iter().zip(grads.iter()) {
            assert_eq!(p.dim(), g.dim());
        }
        assert_eq!(params[0].dim(), (8, 4));
        assert_eq!(params[params.len() - 2].dim(), (4, 2));
        assert_eq!(params[params.len() - 1].dim(), (1, 2));
    }

    #[test]
    fn test_input_validation() {
        let model = TransformerModel::new(tiny_config()).unwrap();
        assert!(model.forward(&SEQUENCE, &MASK[..5]).is_err());
        assert!(model.forward(&[], &[]).is_err());
        assert!(model.forward(&[2; 11], &[1; 11]).is_err());
    }

    #[test]
    fn test_head_rejects_multi_row_input() {
        let head = ClassificationHead::new(4, 2, 0.1, &mut init_rng(Some(1)));
        assert!(head.forward(&Matrix::zeros((2, 4))).is_err());
        assert!(head.forward(&Matrix::zeros((1, 5))).is_err());
        assert_eq!(head.forward(&Matrix::zeros((1, 4))).unwrap().output.dim(), (1, 2));
    }

    #[test]
    fn test_predict_probabilities() {
        let model = TransformerModel::new(tiny_config()).unwrap();
        let prediction = model.predict(&SEQUENCE, &MASK).unwrap();

        assert_eq!(prediction.probabilities.len(), 2);
        assert_abs_diff_eq!(prediction.probabilities.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_eq!(prediction.probability, prediction.probabilities[prediction.class]);
        assert!(prediction.probability >= 0.5);
    }

    #[test]
    fn test_masked_positions_receive_no_gradient() {
        let mut model = TransformerModel::new(tiny_config()).unwrap();
        let result = model.forward(&SEQUENCE, &MASK).unwrap();
        model
            .backward(&Matrix::ones((1, 2)), result.cache)
            .unwrap();

        let grad = model.gradients()[0];
        // PAD(0) 只出现在被掩码的位置
        assert!(grad.row(0).iter().all(|&v| v == 0.0));
        assert!(grad.row(2).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_head_gradients() {
        let mut head = ClassificationHead::new(4, 3, 0.5, &mut init_rng(Some(2)));
        let x = Matrix::random_uniform((1, 4), 1.0, &mut init_rng(Some(3)));
        gradcheck::check_layer(&mut head, &x);
    }

    #[test]
    fn test_encoder_block_gradients() {
        let config = TransformerConfig {
            init_range: 0.5,
            ..tiny_config()
        };
        let mut block = EncoderBlock::new(&config, &mut init_rng(Some(4))).unwrap();
        let x = Matrix::random_uniform((4, 4), 1.0, &mut init_rng(Some(5)));
        gradcheck::check_masked_layer(&mut block, &x, &[1, 1, 1, 0]);
    }

    #[test]
    fn test_full_model_gradients() {
        let config = TransformerConfig {
            init_range: 0.5,
            max_seq_len: 6,
            ..tiny_config()
        };
        let sequence = [2, 5, 4, 3, 0, 0];
        let mask = [1, 1, 1, 1, 0, 0];

        let mut model = TransformerModel::new(config).unwrap();
        model.zero_grad();
        let result = model.forward(&sequence, &mask).unwrap();
        let r = gradcheck::probe(result.output.dim());
        model.backward(&r, result.cache).unwrap();

        gradcheck::check_parameters(&mut model, |m| {
            gradcheck::weighted_sum(&m.forward(&sequence, &mask).unwrap().output, &r)
        });
    }
}
