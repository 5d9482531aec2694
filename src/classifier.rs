//! 代码片段分类器
//!
//! 把分词器、词汇表和 Transformer 模型组合成端到端的训练 / 预测流程，
//! 并负责把模型和词汇表一起保存到同一目录。

use std::fs;
use std::path::Path;

use tracing::info;

use crate::checkpoint::{ModelState, TrainingHistory};
use crate::dataset::{EncodedExample, EncodedSequence, LabeledSnippet, Vocabulary};
use crate::error::{ModelError, Result};
use crate::tokenizer::CodeTokenizer;
use crate::trainer::{RunConfig, Trainer};
use crate::transformer::{Prediction, TransformerConfig, TransformerModel};

/// 模型权重文件名
pub const MODEL_FILE: &str = "model.bin";
/// 词汇表文件名
pub const VOCABULARY_FILE: &str = "vocabulary.json";

/// 训练好的代码分类器
#[derive(Debug, Clone)]
pub struct CodeClassifier {
    model: TransformerModel,
    vocabulary: Vocabulary,
    tokenizer: CodeTokenizer,
}

impl CodeClassifier {
    /// 组合已有的模型和词汇表
    ///
    /// 词汇表中的 ID 必须都落在嵌入表内，编码长度不能超过模型的最大序列长度。
    pub fn from_parts(model: TransformerModel, vocabulary: Vocabulary) -> Result<Self> {
        let config = model.config();
        if vocabulary.len() > config.vocab_size {
            return Err(ModelError::InvalidConfig(format!(
                "vocabulary has {} tokens but the model embeds only {}",
                vocabulary.len(),
                config.vocab_size
            )));
        }
        if vocabulary.max_len() > config.max_seq_len {
            return Err(ModelError::InvalidConfig(format!(
                "vocabulary encodes {} positions but the model supports {}",
                vocabulary.max_len(),
                config.max_seq_len
            )));
        }

        Ok(Self {
            model,
            vocabulary,
            tokenizer: CodeTokenizer::new(),
        })
    }

    /// 在标注语料上训练新的分类器
    ///
    /// 词汇表由语料构建，`vocab_size` 取词汇表的实际大小，
    /// 编码长度取 `max_seq_len`。
    pub fn train(
        corpus: &[LabeledSnippet],
        run_config: &RunConfig,
    ) -> Result<(Self, TrainingHistory)> {
        let tokenizer = CodeTokenizer::new();
        let tokenized: Vec<Vec<String>> = corpus
            .iter()
            .map(|snippet| tokenizer.tokenize(&snippet.code))
            .collect();

        let vocabulary = Vocabulary::build(&tokenized, run_config.model.max_seq_len)?;
        let config = TransformerConfig {
            vocab_size: vocabulary.len(),
            ..run_config.model
        };
        info!(
            "Vocabulary: {} tokens from {} snippets",
            vocabulary.len(),
            corpus.len()
        );

        let examples: Vec<EncodedExample> = tokenized
            .iter()
            .zip(corpus)
            .map(|(tokens, snippet)| EncodedExample {
                sequence: vocabulary.encode(tokens),
                label: snippet.label,
            })
            .collect();

        let mut model = TransformerModel::new(config)?;
        let history = Trainer::new(run_config.trainer.clone()).fit(&mut model, &examples)?;

        Ok((
            Self {
                model,
                vocabulary,
                tokenizer,
            },
            history,
        ))
    }

    /// 分词并编码为定长序列
    pub fn encode(&self, code: &str) -> EncodedSequence {
        self.vocabulary.encode(&self.tokenizer.tokenize(code))
    }

    /// 预测代码片段的类别
    pub fn analyze(&self, code: &str) -> Result<Prediction> {
        let encoded = self.encode(code);
        self.model
            .predict(&encoded.token_ids, &encoded.attention_mask)
    }

    pub fn model(&self) -> &TransformerModel {
        &self.model
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// 保存模型（二进制）和词汇表（JSON）到目录
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.model.state().save_binary(dir.join(MODEL_FILE))?;
        self.vocabulary.save_json(dir.join(VOCABULARY_FILE))?;
        info!("Saved classifier to '{}'", dir.display());
        Ok(())
    }

    /// 从目录加载
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let model = TransformerModel::from_state(ModelState::load_binary(dir.join(MODEL_FILE))?)?;
        let vocabulary = Vocabulary::load_json(dir.join(VOCABULARY_FILE))?;
        info!("Loaded classifier from '{}'", dir.display());
        Self::from_parts(model, vocabulary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::parse_labeled_corpus;
    use crate::trainer::TrainerConfig;

    const CORPUS: &str = "
        try (FileInputStream fis = new FileInputStream(path)) { fis.read(); } |||LABEL|||0
        PreparedStatement stmt = conn.prepareStatement(query); stmt.setString(1, input); |||LABEL|||0
        String q = \"SELECT * FROM users WHERE name = '\" + input + \"'\"; stmt.execute(q); |||LABEL|||1
        Runtime.getRuntime().exec(\"sh -c \" + input); |||LABEL|||1
    ";

    fn run_config() -> RunConfig {
        RunConfig {
            model: TransformerConfig {
                vocab_size: 2,
                d_model: 4,
                n_heads: 2,
                d_ff: 16,
                n_layers: 2,
                n_classes: 2,
                max_seq_len: 24,
                init_range: 0.1,
                layer_norm_eps: 1e-6,
                seed: Some(42),
            },
            trainer: TrainerConfig {
                epochs: 3,
                learning_rate: 0.01,
                shuffle_seed: Some(1),
                ..TrainerConfig::default()
            },
        }
    }

    #[test]
    fn test_train_sets_vocab_size() {
        let corpus = parse_labeled_corpus(CORPUS).unwrap();
        let (classifier, history) = CodeClassifier::train(&corpus, &run_config()).unwrap();

        assert_eq!(history.epochs(), 3);
        assert_eq!(
            classifier.model().config().vocab_size,
            classifier.vocabulary().len()
        );
        assert_eq!(classifier.encode("stmt.execute(q);").len(), 24);
    }

    #[test]
    fn test_save_and_load_predict_identically() {
        let corpus = parse_labeled_corpus(CORPUS).unwrap();
        let (classifier, _) = CodeClassifier::train(&corpus, &run_config()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        classifier.save(dir.path()).unwrap();
        assert!(dir.path().join(MODEL_FILE).exists());
        assert!(dir.path().join(VOCABULARY_FILE).exists());

        let loaded = CodeClassifier::load(dir.path()).unwrap();
        let code = "Runtime.getRuntime().exec(cmd); // unknown tokens too";
        assert_eq!(classifier.analyze(code).unwrap(), loaded.analyze(code).unwrap());
    }

    #[test]
    fn test_from_parts_rejects_oversized_vocabulary() {
        let model = TransformerModel::new(TransformerConfig {
            vocab_size: 4,
            ..run_config().model
        })
        .unwrap();
        let vocabulary = Vocabulary::build(&[vec!["a", "b"]], 24).unwrap();
        assert!(matches!(
            CodeClassifier::from_parts(model, vocabulary),
            Err(ModelError::InvalidConfig(_))
        ));
    }
}
