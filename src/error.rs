//! 错误类型
//!
//! 所有组件共享同一个错误枚举：形状不匹配、缓存误用、参数/梯度列表不一致等
//! 都在违规发生处以 `Err` 返回，绝不静默截断或填充。

use thiserror::Error;

/// 本 crate 的 Result 别名
pub type Result<T> = std::result::Result<T, ModelError>;

/// 模型、训练与持久化过程中可能出现的错误
#[derive(Error, Debug)]
pub enum ModelError {
    /// 矩阵形状不匹配
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// 非法配置（例如 d_model 不能被 n_heads 整除）
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// 在 forward 之前调用了 backward
    #[error("{0}: backward called without a matching forward")]
    MissingCache(&'static str),

    /// 参数列表与梯度列表长度不一致
    #[error("parameter/gradient count mismatch: {params} parameters, {grads} gradients")]
    ParameterCountMismatch { params: usize, grads: usize },

    /// 类别索引越界
    #[error("class index {class} out of range for {n_classes} classes")]
    InvalidClass { class: usize, n_classes: usize },

    /// 数据集解析错误
    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl ModelError {
    /// 构造形状错误的便捷函数
    pub(crate) fn shape(
        what: &str,
        expected: (usize, usize),
        actual: (usize, usize),
    ) -> Self {
        ModelError::ShapeMismatch(format!(
            "{}: expected {}x{}, got {}x{}",
            what, expected.0, expected.1, actual.0, actual.1
        ))
    }
}
