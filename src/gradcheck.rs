//! 有限差分梯度检查（仅测试使用）
//!
//! 标量损失取 `L = Σ output ⊙ R`，其中 R 为固定的随机探针矩阵，
//! 因此 `∂L/∂output = R`。解析梯度与中心差分逐元素比较：
//!
//! ```text
//! numeric = (L(θ + h) − L(θ − h)) / 2h
//! |analytic − numeric| ≤ atol + rtol · max(|analytic|, |numeric|)
//! ```

use crate::tensor::{init_rng, Matrix, TensorExt};
use crate::trainable::{Layer, MaskedLayer, Parameterized};

const H: f64 = 1e-5;
const RTOL: f64 = 1e-4;
const ATOL: f64 = 1e-6;

/// 固定种子的探针矩阵
pub(crate) fn probe(shape: (usize, usize)) -> Matrix {
    Matrix::random_uniform(shape, 1.0, &mut init_rng(Some(1234)))
}

pub(crate) fn weighted_sum(output: &Matrix, probe: &Matrix) -> f64 {
    (output * probe).sum()
}

pub(crate) fn assert_close(what: &str, analytic: f64, numeric: f64) {
    let tolerance = ATOL + RTOL * analytic.abs().max(numeric.abs());
    assert!(
        (analytic - numeric).abs() <= tolerance,
        "{}: analytic {:e} vs numeric {:e}",
        what,
        analytic,
        numeric
    );
}

fn set_parameter<P: Parameterized>(
    component: &mut P,
    index: usize,
    at: (usize, usize),
    value: f64,
) {
    let (mut params, _) = component.parameters_and_gradients();
    params[index][at] = value;
}

/// 对组件的每个参数元素做中心差分，并与 `gradients()` 中已累加的解析梯度比较
pub(crate) fn check_parameters<P, F>(component: &mut P, loss: F)
where
    P: Parameterized,
    F: Fn(&P) -> f64,
{
    let analytic: Vec<Matrix> = component.gradients().into_iter().cloned().collect();
    assert_eq!(analytic.len(), component.parameters().len());

    for (index, grad) in analytic.iter().enumerate() {
        for ((i, j), &expected) in grad.indexed_iter() {
            let original = component.parameters()[index][[i, j]];

            set_parameter(component, index, (i, j), original + H);
            let plus = loss(&*component);
            set_parameter(component, index, (i, j), original - H);
            let minus = loss(&*component);
            set_parameter(component, index, (i, j), original);

            let numeric = (plus - minus) / (2.0 * H);
            assert_close(
                &format!("parameter {} [{}, {}]", index, i, j),
                expected,
                numeric,
            );
        }
    }
}

/// 对输入矩阵的每个元素做中心差分
pub(crate) fn check_input<F>(analytic: &Matrix, input: &Matrix, loss: F)
where
    F: Fn(&Matrix) -> f64,
{
    assert_eq!(analytic.dim(), input.dim());
    let mut x = input.clone();
    for ((i, j), &expected) in analytic.indexed_iter() {
        let original = x[[i, j]];

        x[[i, j]] = original + H;
        let plus = loss(&x);
        x[[i, j]] = original - H;
        let minus = loss(&x);
        x[[i, j]] = original;

        let numeric = (plus - minus) / (2.0 * H);
        assert_close(&format!("input [{}, {}]", i, j), expected, numeric);
    }
}

/// 检查无掩码层的输入梯度与参数梯度
pub(crate) fn check_layer<L: Layer>(layer: &mut L, input: &Matrix) {
    layer.zero_grad();
    let result = layer.forward(input).unwrap();
    let r = probe(result.output.dim());
    let grad_input = layer.backward(&r, result.cache).unwrap();

    let loss = |l: &L, x: &Matrix| weighted_sum(&l.forward(x).unwrap().output, &r);
    {
        let frozen: &L = layer;
        check_input(&grad_input, input, |x| loss(frozen, x));
    }
    check_parameters(layer, |l| loss(l, input));
}

/// 检查带掩码层的输入梯度与参数梯度
pub(crate) fn check_masked_layer<L: MaskedLayer>(layer: &mut L, input: &Matrix, mask: &[u8]) {
    layer.zero_grad();
    let result = layer.forward(input, mask).unwrap();
    let r = probe(result.output.dim());
    let grad_input = layer.backward(&r, result.cache).unwrap();

    let loss = |l: &L, x: &Matrix| weighted_sum(&l.forward(x, mask).unwrap().output, &r);
    {
        let frozen: &L = layer;
        check_input(&grad_input, input, |x| loss(frozen, x));
    }
    check_parameters(layer, |l| loss(l, input));
}
