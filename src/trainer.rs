//! 训练器
//!
//! 逐样本的训练循环（无 batch）：
//!
//! ```text
//! forward → loss.forward → loss.backward → zero_grad → model.backward → optimizer.step
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

use ndarray::Axis;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::TrainingHistory;
use crate::dataset::EncodedExample;
use crate::error::{ModelError, Result};
use crate::loss::{Accuracy, CrossEntropyLoss};
use crate::optimizer::{Adam, Optimizer};
use crate::tensor::{init_rng, Matrix};
use crate::trainable::Parameterized;
use crate::transformer::{TransformerConfig, TransformerModel};

/// 训练配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// 训练轮数
    pub epochs: usize,
    /// 学习率
    pub learning_rate: f64,
    /// Adam β1
    pub beta1: f64,
    /// Adam β2
    pub beta2: f64,
    /// Adam ε
    pub eps: f64,
    /// 每个 epoch 是否打乱样本顺序
    pub shuffle: bool,
    /// 打乱顺序用的随机种子
    pub shuffle_seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            shuffle: true,
            shuffle_seed: None,
        }
    }
}

/// 一次完整运行的配置：模型结构 + 训练超参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: TransformerConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

impl RunConfig {
    /// 从 JSON 文件加载并验证
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: RunConfig = serde_json::from_reader(reader)?;
        config.model.validate()?;
        debug!(path = %path.as_ref().display(), "loaded run configuration");
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// 评估统计数据
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalStats {
    /// 平均损失
    pub loss: f64,
    /// 准确率
    pub accuracy: f64,
    pub examples: usize,
}

/// 训练器
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    fn check_examples(model: &TransformerModel, examples: &[EncodedExample]) -> Result<()> {
        if examples.is_empty() {
            return Err(ModelError::Dataset("no training examples".to_string()));
        }
        let n_classes = model.config().n_classes;
        if let Some(bad) = examples.iter().find(|e| e.label >= n_classes) {
            return Err(ModelError::InvalidClass {
                class: bad.label,
                n_classes,
            });
        }
        Ok(())
    }

    /// 训练模型
    ///
    /// 每个样本执行一次完整的前向、反向和参数更新。
    pub fn fit(
        &self,
        model: &mut TransformerModel,
        examples: &[EncodedExample],
    ) -> Result<TrainingHistory> {
        Self::check_examples(model, examples)?;

        let mut optimizer = Adam::new(self.config.learning_rate, &*model)
            .with_betas(self.config.beta1, self.config.beta2)
            .with_eps(self.config.eps);
        let mut loss_fn = CrossEntropyLoss::new();
        let accuracy = Accuracy::new();
        let mut rng = init_rng(self.config.shuffle_seed);

        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut history = TrainingHistory::new();

        info!(
            "Training {} parameters on {} examples for {} epochs",
            model.parameter_count(),
            examples.len(),
            self.config.epochs
        );

        for epoch in 0..self.config.epochs {
            let start = Instant::now();
            if self.config.shuffle {
                order.shuffle(&mut rng);
            }

            let mut total_loss = 0.0;
            let mut logits = Vec::with_capacity(examples.len());

            for &i in &order {
                let example = &examples[i];
                let sequence = &example.sequence;

                let result = model.forward(&sequence.token_ids, &sequence.attention_mask)?;
                total_loss += loss_fn.forward(&result.output, example.label)?;
                let grad_logits = loss_fn.backward()?;

                optimizer.zero_grad(model);
                model.backward(&grad_logits, result.cache)?;
                optimizer.step(model)?;

                logits.push(result.output);
            }

            let targets: Vec<usize> = order.iter().map(|&i| examples[i].label).collect();
            let avg_loss = total_loss / examples.len() as f64;
            let acc = accuracy.compute(&stack_rows(&logits)?, &targets)?;
            history.push(avg_loss, acc, optimizer.lr());

            info!(
                "Epoch {}/{}: loss={:.4} accuracy={:.2}% ({:.2?})",
                epoch + 1,
                self.config.epochs,
                avg_loss,
                acc * 100.0,
                start.elapsed()
            );
        }

        Ok(history)
    }

    /// 评估模型（不更新参数）
    pub fn evaluate(
        &self,
        model: &TransformerModel,
        examples: &[EncodedExample],
    ) -> Result<EvalStats> {
        Self::check_examples(model, examples)?;

        let mut total_loss = 0.0;
        let mut logits = Vec::with_capacity(examples.len());
        for example in examples {
            let sequence = &example.sequence;
            let output = model
                .forward(&sequence.token_ids, &sequence.attention_mask)?
                .output;
            total_loss += CrossEntropyLoss::compute(&output, example.label)?;
            logits.push(output);
        }

        let targets: Vec<usize> = examples.iter().map(|e| e.label).collect();
        Ok(EvalStats {
            loss: total_loss / examples.len() as f64,
            accuracy: Accuracy::new().compute(&stack_rows(&logits)?, &targets)?,
            examples: examples.len(),
        })
    }
}

/// 将若干 [1, n] 行按行堆叠
fn stack_rows(rows: &[Matrix]) -> Result<Matrix> {
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| ModelError::ShapeMismatch(format!("stack logits: {}", e)))
}
