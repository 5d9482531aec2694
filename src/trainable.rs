//! 可训练组件的公共接口
//!
//! 每个组件都是一个显式的 forward/backward 对：
//!
//! ```text
//! forward(input, ...)          -> ForwardResult { output, cache }
//! backward(grad_output, cache) -> grad_input
//! ```
//!
//! cache 按值传入 backward，因此一次 forward 的缓存恰好被一次 backward 消费。
//! 参数与梯度以两个平行的有序列表暴露，优化器按位置索引它们。

use crate::error::Result;
use crate::tensor::Matrix;

/// forward 的返回值：输出矩阵 + 反向传播所需的中间值
#[derive(Debug, Clone)]
pub struct ForwardResult<C> {
    pub output: Matrix,
    pub cache: C,
}

impl<C> ForwardResult<C> {
    pub fn new(output: Matrix, cache: C) -> Self {
        Self { output, cache }
    }
}

/// 拥有可训练参数的组件
///
/// `parameters()` 与 `gradients()` 的长度、顺序、形状必须一一对应，
/// 并且在多次调用之间保持稳定。
pub trait Parameterized {
    /// 参数矩阵（有序）
    fn parameters(&self) -> Vec<&Matrix>;

    /// 梯度矩阵（与参数平行）
    fn gradients(&self) -> Vec<&Matrix>;

    /// 同时借出可变参数和只读梯度，供优化器更新
    fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>);

    /// 梯度清零
    fn zero_grad(&mut self);

    /// 标量参数总数
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

/// 不需要掩码的层（LayerNorm、FeedForward、分类头）
pub trait Layer: Parameterized {
    type Cache;

    fn forward(&self, input: &Matrix) -> Result<ForwardResult<Self::Cache>>;

    fn backward(&mut self, grad_output: &Matrix, cache: Self::Cache) -> Result<Matrix>;
}

/// 需要注意力掩码的层（注意力、Encoder Block）
pub trait MaskedLayer: Parameterized {
    type Cache;

    fn forward(&self, input: &Matrix, mask: &[u8]) -> Result<ForwardResult<Self::Cache>>;

    fn backward(&mut self, grad_output: &Matrix, cache: Self::Cache) -> Result<Matrix>;
}

/// 将若干子组件的参数/梯度按顺序拼接
///
/// 容器组件（Encoder Block、完整模型）用它实现 `parameters_and_gradients`。
pub(crate) fn collect_parameters_and_gradients<'a>(
    parts: Vec<&'a mut dyn Parameterized>,
) -> (Vec<&'a mut Matrix>, Vec<&'a Matrix>) {
    let mut params = Vec::new();
    let mut grads = Vec::new();
    for part in parts {
        let (p, g) = part.parameters_and_gradients();
        params.extend(p);
        grads.extend(g);
    }
    (params, grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    struct Pair {
        w: Matrix,
        dw: Matrix,
        b: Matrix,
        db: Matrix,
    }

    impl Parameterized for Pair {
        fn parameters(&self) -> Vec<&Matrix> {
            vec![&self.w, &self.b]
        }

        fn gradients(&self) -> Vec<&Matrix> {
            vec![&self.dw, &self.db]
        }

        fn parameters_and_gradients(&mut self) -> (Vec<&mut Matrix>, Vec<&Matrix>) {
            (vec![&mut self.w, &mut self.b], vec![&self.dw, &self.db])
        }

        fn zero_grad(&mut self) {
            self.dw.fill(0.0);
            self.db.fill(0.0);
        }
    }

    fn pair() -> Pair {
        Pair {
            w: Array2::ones((2, 3)),
            dw: Array2::ones((2, 3)),
            b: Array2::ones((1, 3)),
            db: Array2::ones((1, 3)),
        }
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(pair().parameter_count(), 9);
    }

    #[test]
    fn test_collect_keeps_order() {
        let mut first = pair();
        let mut second = pair();
        second.w = Array2::zeros((4, 4));
        second.dw = Array2::zeros((4, 4));

        let (params, grads) = collect_parameters_and_gradients(vec![
            &mut first as &mut dyn Parameterized,
            &mut second,
        ]);
        assert_eq!(params.len(), 4);
        assert_eq!(grads.len(), 4);
        assert_eq!(params[2].dim(), (4, 4));
        assert_eq!(grads[2].dim(), (4, 4));
    }

    #[test]
    fn test_zero_grad() {
        let mut p = pair();
        p.zero_grad();
        assert!(p.gradients().iter().all(|g| g.iter().all(|&v| v == 0.0)));
    }
}
