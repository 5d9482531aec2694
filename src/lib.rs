//! # Code Transformer
//!
//! 一个从零实现、手写反向传播的小型 Transformer Encoder，用于给源代码片段分类。
//!
//! ## 架构概览
//!
//! ```text
//! Tokens → Embedding → Positional Encoding →
//!     [Encoder Block × N] → pooled row 0 → Classification Head → logits
//!     ├── Multi-Head Self-Attention (masked)
//!     ├── Add & Norm
//!     ├── Feed Forward Network (ReLU)
//!     └── Add & Norm
//! ```
//!
//! 每个组件都是显式的 forward/backward 对，没有自动微分；
//! 参数与梯度以平行的有序列表暴露给 Adam 优化器。

pub mod error;
pub mod tensor;
pub mod trainable;
pub mod embedding;
pub mod attention;
pub mod layers;
pub mod transformer;
pub mod loss;
pub mod optimizer;
pub mod tokenizer;
pub mod dataset;
pub mod checkpoint;
pub mod trainer;
pub mod classifier;

#[cfg(test)]
mod gradcheck;

pub use error::{ModelError, Result};
pub use tensor::{init_rng, Matrix, TensorExt};
pub use trainable::{ForwardResult, Layer, MaskedLayer, Parameterized};
pub use embedding::{EmbeddingTable, PositionalEncoding};
pub use attention::{MultiHeadAttention, SelfAttention};
pub use layers::{FeedForward, LayerNorm};
pub use transformer::{
    ClassificationHead, EncoderBlock, ModelCache, Prediction, TransformerConfig, TransformerModel,
};
pub use loss::{Accuracy, CrossEntropyLoss};
pub use optimizer::{Adam, Optimizer};
pub use tokenizer::CodeTokenizer;
pub use dataset::{
    load_labeled_corpus, parse_labeled_corpus, EncodedExample, EncodedSequence, LabeledSnippet,
    Vocabulary,
};
pub use checkpoint::{ModelState, SerializableArray, TrainingHistory};
pub use trainer::{EvalStats, RunConfig, Trainer, TrainerConfig};
pub use classifier::CodeClassifier;

/// 预设配置
pub mod configs {
    use super::{RunConfig, TrainerConfig, TransformerConfig};

    /// 正式训练用的配置
    ///
    /// `vocab_size` 在训练时由词汇表的实际大小覆盖。
    pub fn production() -> RunConfig {
        RunConfig {
            model: TransformerConfig {
                vocab_size: 10000,
                d_model: 64,
                n_heads: 8,
                d_ff: 256,
                n_layers: 3,
                n_classes: 8,
                max_seq_len: 100,
                init_range: 0.1,
                layer_norm_eps: 1e-6,
                seed: None,
            },
            trainer: TrainerConfig {
                epochs: 20,
                learning_rate: 0.001,
                ..TrainerConfig::default()
            },
        }
    }

    /// 极小模型（用于快速测试和调试）
    pub fn tiny() -> RunConfig {
        RunConfig {
            model: TransformerConfig {
                vocab_size: 10000,
                d_model: 4,
                n_heads: 2,
                d_ff: 16,
                n_layers: 2,
                n_classes: 2,
                max_seq_len: 10,
                init_range: 0.1,
                layer_norm_eps: 1e-6,
                seed: Some(42),
            },
            trainer: TrainerConfig {
                epochs: 20,
                learning_rate: 0.01,
                shuffle_seed: Some(42),
                ..TrainerConfig::default()
            },
        }
    }
}
