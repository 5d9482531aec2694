//! 优化器
//!
//! Adam 按位置维护与模型参数列表一一对应的一阶/二阶矩估计。

use crate::error::{ModelError, Result};
use crate::tensor::Matrix;
use crate::trainable::Parameterized;

/// 优化器 trait
pub trait Optimizer {
    /// 用模型当前累加的梯度更新一次全部参数
    fn step(&mut self, model: &mut dyn Parameterized) -> Result<()>;

    /// 梯度清零（委托给模型）
    fn zero_grad(&self, model: &mut dyn Parameterized) {
        model.zero_grad();
    }

    /// 获取当前学习率
    fn lr(&self) -> f64;

    /// 设置学习率
    fn set_lr(&mut self, lr: f64);

    /// 优化器名称
    fn name(&self) -> &str;
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * g
/// v = β2 * v + (1 - β2) * g²
/// m̂ = m / (1 - β1^t)
/// v̂ = v / (1 - β2^t)
/// param = param - lr * m̂ / (√v̂ + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    /// 学习率
    lr: f64,
    /// β1：一阶矩估计的指数衰减率
    beta1: f64,
    /// β2：二阶矩估计的指数衰减率
    beta2: f64,
    /// ε：数值稳定性常数
    eps: f64,
    /// 一阶矩估计（与参数列表按位置对齐）
    m: Vec<Matrix>,
    /// 二阶矩估计
    v: Vec<Matrix>,
    /// 时间步
    t: u64,
}

impl Adam {
    /// 按模型当前的参数列表创建全零的矩估计
    pub fn new<P: Parameterized + ?Sized>(lr: f64, model: &P) -> Self {
        let zeros: Vec<Matrix> = model
            .parameters()
            .iter()
            .map(|p| Matrix::zeros(p.dim()))
            .collect();

        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: zeros.clone(),
            v: zeros,
            t: 0,
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// 已执行的步数
    pub fn step_count(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, model: &mut dyn Parameterized) -> Result<()> {
        let (params, grads) = model.parameters_and_gradients();

        if params.len() != grads.len() {
            return Err(ModelError::ParameterCountMismatch {
                params: params.len(),
                grads: grads.len(),
            });
        }
        if params.len() != self.m.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "optimizer tracks {} parameters, model exposes {}",
                self.m.len(),
                params.len()
            )));
        }
        for (i, (p, g)) in params.iter().zip(grads.iter()).enumerate() {
            if p.dim() != g.dim() || p.dim() != self.m[i].dim() {
                return Err(ModelError::ShapeMismatch(format!(
                    "parameter {}: {:?} with gradient {:?} and moments {:?}",
                    i,
                    p.dim(),
                    g.dim(),
                    self.m[i].dim()
                )));
            }
        }

        self.t += 1;
        let t = self.t as i32;
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for ((param, grad), (m, v)) in params
            .into_iter()
            .zip(grads)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            ndarray::Zip::from(param)
                .and(&*m)
                .and(&*v)
                .for_each(|p, &m, &v| {
                    let m_hat = m / bias1;
                    let v_hat = v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }

        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "Adam"
    }
}
