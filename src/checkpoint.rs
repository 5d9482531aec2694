//! 模型检查点保存和加载
//!
//! 支持保存和加载模型权重（JSON / 二进制）以及训练历史。

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModelError, Result};
use crate::tensor::{ensure_shape, Matrix};
use crate::trainable::Parameterized;
use crate::transformer::{TransformerConfig, TransformerModel};

/// 可序列化的 Array2 包装器
///
/// ndarray::Array2 的序列化包装器，用于 serde
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray {
    /// 数据（行优先）
    pub data: Vec<f64>,
    /// 形状 (rows, cols)
    pub shape: (usize, usize),
}

impl SerializableArray {
    /// 从 Array2 创建
    pub fn from_array(arr: &Matrix) -> Self {
        Self {
            data: arr.iter().copied().collect(),
            shape: arr.dim(),
        }
    }

    /// 转换为 Array2
    pub fn to_array(&self) -> Result<Matrix> {
        Matrix::from_shape_vec(self.shape, self.data.clone()).map_err(|e| {
            ModelError::ShapeMismatch(format!(
                "{} values cannot form a {}x{} matrix: {}",
                self.data.len(),
                self.shape.0,
                self.shape.1,
                e
            ))
        })
    }
}

/// 模型状态：配置 + 按参数顺序排列的全部权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub config: TransformerConfig,
    pub parameters: Vec<SerializableArray>,
}

impl ModelState {
    /// 保存为 JSON 格式
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        info!(path = %path.as_ref().display(), "saved model state (json)");
        Ok(())
    }

    /// 从 JSON 格式加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 保存为二进制格式（更紧凑，浮点数逐位保持不变）
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(writer, self)?;
        info!(path = %path.as_ref().display(), "saved model state (binary)");
        Ok(())
    }

    /// 从二进制格式加载
    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

impl TransformerModel {
    /// 当前全部参数的快照
    pub fn state(&self) -> ModelState {
        ModelState {
            config: *self.config(),
            parameters: self
                .parameters()
                .into_iter()
                .map(SerializableArray::from_array)
                .collect(),
        }
    }

    /// 按保存的配置重建模型并写回参数
    ///
    /// 参数个数和每个参数的形状都必须与配置构造出的模型一致。
    pub fn from_state(state: ModelState) -> Result<Self> {
        let mut model = TransformerModel::new(state.config)?;
        {
            let (params, _) = model.parameters_and_gradients();
            if params.len() != state.parameters.len() {
                return Err(ModelError::ShapeMismatch(format!(
                    "state holds {} parameters, model expects {}",
                    state.parameters.len(),
                    params.len()
                )));
            }

            for (i, (param, saved)) in params.into_iter().zip(&state.parameters).enumerate() {
                let value = saved.to_array()?;
                ensure_shape(&format!("parameter {}", i), &value, param.dim())?;
                *param = value;
            }
        }
        Ok(model)
    }
}

/// 训练历史记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// 每个 epoch 的平均损失
    pub losses: Vec<f64>,
    /// 每个 epoch 的训练准确率
    pub accuracies: Vec<f64>,
    /// 学习率历史
    pub learning_rates: Vec<f64>,
}

impl TrainingHistory {
    /// 创建新的训练历史
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个 epoch 的记录
    pub fn push(&mut self, loss: f64, accuracy: f64, lr: f64) {
        self.losses.push(loss);
        self.accuracies.push(accuracy);
        self.learning_rates.push(lr);
    }

    pub fn epochs(&self) -> usize {
        self.losses.len()
    }

    /// 获取最佳准确率
    pub fn best_accuracy(&self) -> Option<f64> {
        self.accuracies.iter().copied().reduce(f64::max)
    }

    /// 获取最佳 epoch（从 0 开始）
    pub fn best_epoch(&self) -> Option<usize> {
        self.accuracies
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }

    /// 保存训练历史
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 加载训练历史
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 训练历史摘要
    pub fn summary(&self) -> String {
        format!(
            "Training Summary:\n  Epochs: {}\n  Best Acc: {:.2}% (epoch {})\n  Final Loss: {:.4}",
            self.epochs(),
            self.best_accuracy().unwrap_or(0.0) * 100.0,
            self.best_epoch().map_or(0, |e| e + 1),
            self.losses.last().copied().unwrap_or(0.0)
        )
    }
}
