//! ネットワーク出力の入力に関する高階微分。
//!
//! 入力を一方向に動かしたときの出力の微分列（ジェット）を、各層を通して
//! テイラーモードで前向きに伝播させて求めます。計算はすべて `burn` の
//! テンソル演算なので、パラメータに関する勾配は通常どおり逆伝播で得られます。
//!
//! 異なる2変数の混合偏微分は、複数の方向微分から Vandermonde 系を解いて取り出します。

use crate::data::PointSet;
use crate::error::{PinnError, Result};
use crate::expr::{Expr, input_derivative};
use crate::model::Mlp;
use burn::nn::Linear;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

pub(crate) fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// 線形層: `y₀ = W z₀ + b`, `yₖ = W zₖ`。
pub(crate) fn linear_jet<B: Backend>(
    linear: &Linear<B>,
    z: Vec<Tensor<B, 2>>,
) -> Vec<Tensor<B, 2>> {
    let weight = linear.weight.val();
    z.into_iter()
        .enumerate()
        .map(|(k, zk)| {
            if k == 0 {
                linear.forward(zk)
            } else {
                zk.matmul(weight.clone())
            }
        })
        .collect()
}

/// 合成関数 `f(z(t))` の微分列を Faà di Bruno の公式で求めます。
///
/// `fd[k] = f⁽ᵏ⁾(z₀)`, `z[k] = z⁽ᵏ⁾` とすると
/// `yₙ = Σₖ f⁽ᵏ⁾(z₀)·Bₙ,ₖ(z₁, …, zₙ₋ₖ₊₁)`（`Bₙ,ₖ` は部分 Bell 多項式）。
pub(crate) fn compose<B: Backend>(fd: &[Tensor<B, 2>], z: &[Tensor<B, 2>]) -> Vec<Tensor<B, 2>> {
    let n = z.len() - 1;
    // bell[m][k] = B_{m,k}, 1 <= k <= m <= n
    let mut bell: Vec<Vec<Option<Tensor<B, 2>>>> = vec![vec![None; n + 1]; n + 1];
    for m in 1..=n {
        bell[m][1] = Some(z[m].clone());
        for k in 2..=m {
            let mut acc: Option<Tensor<B, 2>> = None;
            for i in 1..=(m - k + 1) {
                if let Some(prev) = &bell[m - i][k - 1] {
                    let term = z[i]
                        .clone()
                        .mul(prev.clone())
                        .mul_scalar(binomial(m - 1, i - 1));
                    acc = Some(match acc {
                        Some(a) => a + term,
                        None => term,
                    });
                }
            }
            bell[m][k] = acc;
        }
    }

    let mut out = Vec::with_capacity(n + 1);
    out.push(fd[0].clone());
    for m in 1..=n {
        let mut y: Option<Tensor<B, 2>> = None;
        for k in 1..=m {
            if let Some(b) = &bell[m][k] {
                let term = fd[k].clone().mul(b.clone());
                y = Some(match y {
                    Some(acc) => acc + term,
                    None => term,
                });
            }
        }
        out.push(y.unwrap_or_else(|| Tensor::zeros_like(&fd[0])));
    }
    out
}

/// 小さな連立一次方程式 `a·x = b` を部分ピボット選択付きガウス消去で解きます。
fn solve_dense(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(PinnError::UnsupportedDerivative(
                "混合微分の係数行列が特異です".to_string(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let s: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - s) / a[row][row];
    }
    Ok(x)
}

/// `∂ᵏ/∂aᵏ ∂ᵐ/∂bᵐ` を方向 `eₐ + tⱼ·e_b` の n 階方向微分の線形結合で表す重み。
///
/// 方向微分は `t` の n 次多項式で、`tᵐ` の係数が `C(n, k)·∂ᵏₐ∂ᵐ_b u` になります。
fn mixed_weights(k: usize, m: usize) -> Result<(Vec<i32>, Vec<f64>)> {
    let n = k + m;
    let ts: Vec<i32> = (0..=n as i32).map(|j| j - (n as i32) / 2).collect();
    // Vᵀ r = e_m を解くと r は V⁻¹ の m 行目
    let vt: Vec<Vec<f64>> = (0..=n)
        .map(|q| ts.iter().map(|&t| (t as f64).powi(q as i32)).collect())
        .collect();
    let mut e = vec![0.0; n + 1];
    e[m] = 1.0;
    let r = solve_dense(vt, e)?;
    let scale = binomial(n, k);
    Ok((ts, r.into_iter().map(|w| w / scale).collect()))
}

enum Value<B: Backend> {
    Scalar(f64),
    Tensor(Tensor<B, 2>),
}

/// 1バッチ分の点群に対するモデルの評価結果。
///
/// 順伝播は生成時に一度だけ行い、方向微分は方向ごとにキャッシュします。
pub struct Evaluation<'a, B: Backend> {
    model: &'a Mlp<B>,
    x: Tensor<B, 2>,
    inputs: BTreeMap<String, Tensor<B, 2>>,
    outputs: Tensor<B, 2>,
    jets: RefCell<HashMap<Vec<i32>, Vec<Tensor<B, 2>>>>,
    rows: usize,
    device: B::Device,
}

impl<'a, B: Backend> Evaluation<'a, B> {
    pub fn new(model: &'a Mlp<B>, points: &PointSet, device: &B::Device) -> Result<Self> {
        let mut inputs = BTreeMap::new();
        let mut columns = Vec::with_capacity(model.input_keys().len());
        for key in model.input_keys() {
            let col = points.column_tensor::<B>(key, device)?;
            columns.push(col.clone());
            inputs.insert(key.clone(), col);
        }
        let x = Tensor::cat(columns, 1);
        let outputs = model.forward(x.clone());
        Ok(Self {
            model,
            x,
            inputs,
            outputs,
            jets: RefCell::new(HashMap::new()),
            rows: points.len(),
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// 出力フィールド `key` の値 `[N, 1]`。
    pub fn output(&self, key: &str) -> Result<Tensor<B, 2>> {
        let j = self.output_index(key)?;
        Ok(self.outputs.clone().slice([0..self.rows, j..j + 1]))
    }

    fn output_index(&self, key: &str) -> Result<usize> {
        self.model
            .output_keys()
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| PinnError::UnknownField(key.to_string()))
    }

    fn input_index(&self, key: &str) -> Result<usize> {
        self.model
            .input_keys()
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| PinnError::UnknownField(key.to_string()))
    }

    /// 方向 `dir` の `order` 階方向微分 `[N, 出力数]`。
    fn directional(&self, dir: Vec<i32>, order: usize) -> Result<Tensor<B, 2>> {
        if let Some(jet) = self.jets.borrow().get(&dir) {
            if jet.len() > order {
                return Ok(jet[order].clone());
            }
        }
        let direction: Vec<f32> = dir.iter().map(|&v| v as f32).collect();
        let jet = self.model.forward_jet(self.x.clone(), &direction, order)?;
        let out = jet[order].clone();
        self.jets.borrow_mut().insert(dir, jet);
        Ok(out)
    }

    fn column(&self, t: Tensor<B, 2>, j: usize) -> Tensor<B, 2> {
        t.slice([0..self.rows, j..j + 1])
    }

    /// 出力フィールド `field` を `wrt` の各入力で偏微分した値 `[N, 1]`。
    pub fn derivative(&self, field: &str, wrt: &[String]) -> Result<Tensor<B, 2>> {
        match self.derivative_value(field, wrt)? {
            Value::Tensor(t) => Ok(t),
            Value::Scalar(v) => Ok(Tensor::full([self.rows, 1], v, &self.device)),
        }
    }

    fn derivative_value(&self, field: &str, wrt: &[String]) -> Result<Value<B>> {
        let mut counts: Vec<(usize, usize)> = Vec::new();
        for var in wrt {
            let axis = self.input_index(var)?;
            match counts.iter_mut().find(|(a, _)| *a == axis) {
                Some((_, c)) => *c += 1,
                None => counts.push((axis, 1)),
            }
        }
        if self.inputs.contains_key(field) {
            return Ok(Value::Scalar(input_derivative(field, wrt)));
        }
        let j = self.output_index(field)?;
        let d = self.model.input_keys().len();

        match counts.as_slice() {
            [] => Ok(Value::Tensor(self.column(self.outputs.clone(), j))),
            [(axis, order)] => {
                let mut dir = vec![0; d];
                dir[*axis] = 1;
                let t = self.directional(dir, *order)?;
                Ok(Value::Tensor(self.column(t, j)))
            }
            [(a, k), (b, m)] => {
                let n = k + m;
                let (ts, weights) = mixed_weights(*k, *m)?;
                let mut acc: Option<Tensor<B, 2>> = None;
                for (t, w) in ts.into_iter().zip(weights) {
                    if w.abs() < 1e-12 {
                        continue;
                    }
                    let mut dir = vec![0; d];
                    dir[*a] = 1;
                    dir[*b] = t;
                    let term = self.column(self.directional(dir, n)?, j).mul_scalar(w);
                    acc = Some(match acc {
                        Some(s) => s + term,
                        None => term,
                    });
                }
                Ok(match acc {
                    Some(t) => Value::Tensor(t),
                    None => Value::Scalar(0.0),
                })
            }
            _ => Err(PinnError::UnsupportedDerivative(format!(
                "3つ以上の変数にまたがる混合微分には対応していません: {}__{}",
                field,
                wrt.join("__")
            ))),
        }
    }

    /// 式を評価して `[行数, 1]` のテンソルを返します。
    pub fn evaluate(&self, expr: &Expr) -> Result<Tensor<B, 2>> {
        match self.eval(expr)? {
            Value::Tensor(t) => Ok(t),
            Value::Scalar(v) => {
                let rows = expr.row_range().map(|r| r.len()).unwrap_or(self.rows);
                Ok(Tensor::full([rows, 1], v, &self.device))
            }
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value<B>> {
        Ok(match expr {
            Expr::Const(v) => Value::Scalar(*v),
            Expr::Var(name) => match self.inputs.get(name) {
                Some(t) => Value::Tensor(t.clone()),
                None => Value::Tensor(self.output(name)?),
            },
            Expr::Deriv { field, wrt } => self.derivative_value(field, wrt)?,
            Expr::Add(a, b) => binary(
                self.eval(a)?,
                self.eval(b)?,
                |x, y| x + y,
                |t, s| t.add_scalar(s),
                |s, t| t.add_scalar(s),
                |x, y| x + y,
            )?,
            Expr::Sub(a, b) => binary(
                self.eval(a)?,
                self.eval(b)?,
                |x, y| x - y,
                |t, s| t.sub_scalar(s),
                |s, t| t.neg().add_scalar(s),
                |x, y| x - y,
            )?,
            Expr::Mul(a, b) => binary(
                self.eval(a)?,
                self.eval(b)?,
                |x, y| x * y,
                |t, s| t.mul_scalar(s),
                |s, t| t.mul_scalar(s),
                |x, y| x * y,
            )?,
            Expr::Div(a, b) => binary(
                self.eval(a)?,
                self.eval(b)?,
                |x, y| x / y,
                |t, s| t.div_scalar(s),
                |s, t| t.recip().mul_scalar(s),
                |x, y| x / y,
            )?,
            Expr::Neg(a) => match self.eval(a)? {
                Value::Scalar(v) => Value::Scalar(-v),
                Value::Tensor(t) => Value::Tensor(t.neg()),
            },
            Expr::Powi(a, n) => match self.eval(a)? {
                Value::Scalar(v) => Value::Scalar(v.powi(*n)),
                Value::Tensor(t) => Value::Tensor(powi(t, *n)),
            },
            Expr::Unary(f, a) => match self.eval(a)? {
                Value::Scalar(v) => Value::Scalar(f.apply(v)),
                Value::Tensor(t) => Value::Tensor(match f {
                    crate::expr::UnaryFn::Sin => t.sin(),
                    crate::expr::UnaryFn::Cos => t.cos(),
                    crate::expr::UnaryFn::Exp => t.exp(),
                    crate::expr::UnaryFn::Tanh => t.tanh(),
                }),
            },
            Expr::Rows { expr, start, end } => match self.eval(expr)? {
                Value::Scalar(v) => Value::Scalar(v),
                Value::Tensor(t) => {
                    let [rows, cols] = t.dims();
                    if start > end || *end > rows {
                        return Err(PinnError::Shape(format!(
                            "行 {}..{} がバッチサイズ {} の外にあります",
                            start, end, rows
                        )));
                    }
                    Value::Tensor(t.slice([*start..*end, 0..cols]))
                }
            },
        })
    }
}

fn binary<B: Backend>(
    a: Value<B>,
    b: Value<B>,
    ss: impl Fn(f64, f64) -> f64,
    ts: impl Fn(Tensor<B, 2>, f64) -> Tensor<B, 2>,
    st: impl Fn(f64, Tensor<B, 2>) -> Tensor<B, 2>,
    tt: impl Fn(Tensor<B, 2>, Tensor<B, 2>) -> Tensor<B, 2>,
) -> Result<Value<B>> {
    Ok(match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => Value::Scalar(ss(x, y)),
        (Value::Tensor(t), Value::Scalar(s)) => Value::Tensor(ts(t, s)),
        (Value::Scalar(s), Value::Tensor(t)) => Value::Tensor(st(s, t)),
        (Value::Tensor(x), Value::Tensor(y)) => {
            if x.dims() != y.dims() {
                return Err(PinnError::Shape(format!(
                    "形状 {:?} と {:?} のテンソルは演算できません",
                    x.dims(),
                    y.dims()
                )));
            }
            Value::Tensor(tt(x, y))
        }
    })
}

fn powi<B: Backend>(t: Tensor<B, 2>, n: i32) -> Tensor<B, 2> {
    if n == 0 {
        return Tensor::ones_like(&t);
    }
    let base = if n < 0 { t.recip() } else { t };
    let mut acc = base.clone();
    for _ in 1..n.unsigned_abs() {
        acc = acc.mul(base.clone());
    }
    acc
}
