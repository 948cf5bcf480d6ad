//! PDE 残差や境界条件を記述する記号式。
//!
//! 式はネットワークの出力・入力・それらの微分を参照する木構造で、
//! [`crate::jet::Evaluation`] でテンソルとして、[`Expr::eval_points`] で
//! データ列上の数値として評価します。

use crate::data::PointSet;
use crate::error::{PinnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Range, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryFn {
    Sin,
    Cos,
    Exp,
    Tanh,
}

impl UnaryFn {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            UnaryFn::Sin => v.sin(),
            UnaryFn::Cos => v.cos(),
            UnaryFn::Exp => v.exp(),
            UnaryFn::Tanh => v.tanh(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Exp => "exp",
            UnaryFn::Tanh => "tanh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(f64),
    /// 入力座標、ネットワーク出力、またはデータ列
    Var(String),
    /// `field` を `wrt` の各変数で順に偏微分したもの
    Deriv { field: String, wrt: Vec<String> },
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Powi(Box<Expr>, i32),
    Unary(UnaryFn, Box<Expr>),
    /// バッチ内の行 `start..end` だけを取り出す
    Rows {
        expr: Box<Expr>,
        start: usize,
        end: usize,
    },
}

impl Expr {
    pub fn c(v: f64) -> Self {
        Expr::Const(v)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn deriv(field: impl Into<String>, wrt: &[&str]) -> Self {
        if wrt.is_empty() {
            return Expr::Var(field.into());
        }
        Expr::Deriv {
            field: field.into(),
            wrt: wrt.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// 1階微分 `∂u/∂x`
    pub fn jacobian(u: &str, x: &str) -> Self {
        Expr::deriv(u, &[x])
    }

    /// 2階微分 `∂²u/∂x²`
    pub fn hessian(u: &str, x: &str) -> Self {
        Expr::deriv(u, &[x, x])
    }

    pub fn rows(self, range: Range<usize>) -> Self {
        Expr::Rows {
            expr: Box::new(self),
            start: range.start,
            end: range.end,
        }
    }

    pub fn powi(self, n: i32) -> Self {
        match (self, n) {
            (_, 0) => Expr::Const(1.0),
            (e, 1) => e,
            (Expr::Const(v), n) => Expr::Const(v.powi(n)),
            (e, n) => Expr::Powi(Box::new(e), n),
        }
    }

    pub fn sin(self) -> Self {
        self.unary(UnaryFn::Sin)
    }

    pub fn cos(self) -> Self {
        self.unary(UnaryFn::Cos)
    }

    pub fn exp(self) -> Self {
        self.unary(UnaryFn::Exp)
    }

    pub fn tanh(self) -> Self {
        self.unary(UnaryFn::Tanh)
    }

    fn unary(self, f: UnaryFn) -> Self {
        match self {
            Expr::Const(v) => Expr::Const(f.apply(v)),
            e => Expr::Unary(f, Box::new(e)),
        }
    }

    fn is_const(&self, v: f64) -> bool {
        matches!(self, Expr::Const(c) if *c == v)
    }

    /// `var` についての偏微分を記号的に求めます。
    pub fn diff(&self, var: &str) -> Expr {
        match self {
            Expr::Const(_) => Expr::Const(0.0),
            Expr::Var(name) if name == var => Expr::Const(1.0),
            Expr::Var(name) => Expr::deriv(name.clone(), &[var]),
            Expr::Deriv { field, wrt } => {
                let mut wrt = wrt.clone();
                wrt.push(var.to_string());
                Expr::Deriv {
                    field: field.clone(),
                    wrt,
                }
            }
            Expr::Add(a, b) => a.diff(var) + b.diff(var),
            Expr::Sub(a, b) => a.diff(var) - b.diff(var),
            Expr::Mul(a, b) => a.diff(var) * (**b).clone() + (**a).clone() * b.diff(var),
            Expr::Div(a, b) => {
                (a.diff(var) * (**b).clone() - (**a).clone() * b.diff(var))
                    / (**b).clone().powi(2)
            }
            Expr::Neg(a) => -a.diff(var),
            Expr::Powi(a, n) => {
                Expr::Const(*n as f64) * (**a).clone().powi(n - 1) * a.diff(var)
            }
            Expr::Unary(f, a) => {
                let inner = (**a).clone();
                let outer = match f {
                    UnaryFn::Sin => inner.cos(),
                    UnaryFn::Cos => -inner.sin(),
                    UnaryFn::Exp => inner.exp(),
                    UnaryFn::Tanh => 1.0 - inner.tanh().powi(2),
                };
                outer * a.diff(var)
            }
            Expr::Rows { expr, start, end } => Expr::Rows {
                expr: Box::new(expr.diff(var)),
                start: *start,
                end: *end,
            },
        }
    }

    /// 式が参照する名前（微分変数を含む）。
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Deriv { field, wrt } => {
                out.insert(field.clone());
                out.extend(wrt.iter().cloned());
            }
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Expr::Neg(a) | Expr::Powi(a, _) | Expr::Unary(_, a) => a.collect_fields(out),
            Expr::Rows { expr, .. } => expr.collect_fields(out),
        }
    }

    /// 最上位が行スライスならその範囲。
    pub fn row_range(&self) -> Option<Range<usize>> {
        match self {
            Expr::Rows { start, end, .. } => Some(*start..*end),
            _ => None,
        }
    }

    /// データ列だけを使って数値評価します（ラベルや解析解の計算用）。
    ///
    /// 定数式は点数分に複製します。
    pub fn eval_points(&self, points: &PointSet) -> Result<Vec<f32>> {
        Ok(match self.eval_numeric(points)? {
            Numeric::Scalar(v) => vec![v as f32; points.len()],
            Numeric::Column(c) => c.into_iter().map(|v| v as f32).collect(),
        })
    }

    fn eval_numeric(&self, points: &PointSet) -> Result<Numeric> {
        Ok(match self {
            Expr::Const(v) => Numeric::Scalar(*v),
            Expr::Var(name) => {
                Numeric::Column(points.get(name)?.iter().map(|&v| v as f64).collect())
            }
            Expr::Deriv { field, wrt } => {
                if !points.contains(field) {
                    return Err(PinnError::UnsupportedDerivative(format!(
                        "データ列ではない '{}' の微分は数値評価できません",
                        self
                    )));
                }
                Numeric::Scalar(input_derivative(field, wrt))
            }
            Expr::Add(a, b) => a.eval_numeric(points)?.zip(b.eval_numeric(points)?, |x, y| x + y)?,
            Expr::Sub(a, b) => a.eval_numeric(points)?.zip(b.eval_numeric(points)?, |x, y| x - y)?,
            Expr::Mul(a, b) => a.eval_numeric(points)?.zip(b.eval_numeric(points)?, |x, y| x * y)?,
            Expr::Div(a, b) => a.eval_numeric(points)?.zip(b.eval_numeric(points)?, |x, y| x / y)?,
            Expr::Neg(a) => a.eval_numeric(points)?.map(|x| -x),
            Expr::Powi(a, n) => a.eval_numeric(points)?.map(|x| x.powi(*n)),
            Expr::Unary(f, a) => a.eval_numeric(points)?.map(|x| f.apply(x)),
            Expr::Rows { expr, start, end } => match expr.eval_numeric(points)? {
                Numeric::Scalar(v) => Numeric::Scalar(v),
                Numeric::Column(c) => {
                    if start > end || *end > c.len() {
                        return Err(PinnError::Shape(format!(
                            "行 {}..{} が点数 {} の外にあります",
                            start,
                            end,
                            c.len()
                        )));
                    }
                    Numeric::Column(c[*start..*end].to_vec())
                }
            },
        })
    }
}

/// 入力座標どうしの微分: `∂x/∂x = 1`、それ以外は 0。
pub(crate) fn input_derivative(field: &str, wrt: &[String]) -> f64 {
    if wrt.len() == 1 && wrt[0] == field {
        1.0
    } else {
        0.0
    }
}

enum Numeric {
    Scalar(f64),
    Column(Vec<f64>),
}

impl Numeric {
    fn map(self, f: impl Fn(f64) -> f64) -> Numeric {
        match self {
            Numeric::Scalar(v) => Numeric::Scalar(f(v)),
            Numeric::Column(c) => Numeric::Column(c.into_iter().map(f).collect()),
        }
    }

    fn zip(self, other: Numeric, f: impl Fn(f64, f64) -> f64) -> Result<Numeric> {
        Ok(match (self, other) {
            (Numeric::Scalar(a), Numeric::Scalar(b)) => Numeric::Scalar(f(a, b)),
            (Numeric::Scalar(a), Numeric::Column(b)) => {
                Numeric::Column(b.into_iter().map(|y| f(a, y)).collect())
            }
            (Numeric::Column(a), Numeric::Scalar(b)) => {
                Numeric::Column(a.into_iter().map(|x| f(x, b)).collect())
            }
            (Numeric::Column(a), Numeric::Column(b)) => {
                if a.len() != b.len() {
                    return Err(PinnError::Shape(format!(
                        "長さ {} と {} の列は演算できません",
                        a.len(),
                        b.len()
                    )));
                }
                Numeric::Column(a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect())
            }
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Deriv { field, wrt } => {
                write!(f, "{field}")?;
                for v in wrt {
                    write!(f, "__{v}")?;
                }
                Ok(())
            }
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "{a}*{b}"),
            Expr::Div(a, b) => write!(f, "{a}/{b}"),
            Expr::Neg(a) => write!(f, "-{a}"),
            Expr::Powi(a, n) => write!(f, "{a}**{n}"),
            Expr::Unary(func, a) => write!(f, "{}({a})", func.name()),
            Expr::Rows { expr, start, end } => write!(f, "{expr}[{start}:{end}]"),
        }
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        match (self, rhs) {
            (Expr::Const(a), Expr::Const(b)) => Expr::Const(a + b),
            (a, b) if a.is_const(0.0) => b,
            (a, b) if b.is_const(0.0) => a,
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        }
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        match (self, rhs) {
            (Expr::Const(a), Expr::Const(b)) => Expr::Const(a - b),
            (a, b) if b.is_const(0.0) => a,
            (a, b) if a.is_const(0.0) => -b,
            (a, b) => Expr::Sub(Box::new(a), Box::new(b)),
        }
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        match (self, rhs) {
            (Expr::Const(a), Expr::Const(b)) => Expr::Const(a * b),
            (a, b) if a.is_const(0.0) || b.is_const(0.0) => Expr::Const(0.0),
            (a, b) if a.is_const(1.0) => b,
            (a, b) if b.is_const(1.0) => a,
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }
}

impl Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        match (self, rhs) {
            (Expr::Const(a), Expr::Const(b)) => Expr::Const(a / b),
            (a, b) if b.is_const(1.0) => a,
            (a, _) if a.is_const(0.0) => Expr::Const(0.0),
            (a, b) => Expr::Div(Box::new(a), Box::new(b)),
        }
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        match self {
            Expr::Const(v) => Expr::Const(-v),
            Expr::Neg(inner) => *inner,
            e => Expr::Neg(Box::new(e)),
        }
    }
}

macro_rules! scalar_ops {
    ($($trait:ident :: $method:ident),*) => {
        $(
            impl $trait<f64> for Expr {
                type Output = Expr;

                fn $method(self, rhs: f64) -> Expr {
                    $trait::$method(self, Expr::Const(rhs))
                }
            }

            impl $trait<Expr> for f64 {
                type Output = Expr;

                fn $method(self, rhs: Expr) -> Expr {
                    $trait::$method(Expr::Const(self), rhs)
                }
            }
        )*
    };
}

scalar_ops!(Add::add, Sub::sub, Mul::mul, Div::div);

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> PointSet {
        let mut p = PointSet::new();
        p.insert("x", vec![0.0, 0.5, 1.0]).unwrap();
        p
    }

    #[test]
    fn repeated_diff_extends_derivative_chain() {
        let u = Expr::var("u");
        let d3 = u.diff("x").diff("x").diff("x");
        assert_eq!(d3, Expr::deriv("u", &["x", "x", "x"]));
        assert_eq!(d3.to_string(), "u__x__x__x");
        assert_eq!(Expr::hessian("u", "x").diff("x"), d3);
    }

    #[test]
    fn product_rule_evaluates_numerically() {
        let x = Expr::var("x");
        let e = (x.clone() * x.clone() * x).diff("x");
        let v = e.eval_points(&points()).unwrap();
        assert_eq!(v, vec![0.0, 0.75, 3.0]);
    }

    #[test]
    fn chain_rule_through_sin() {
        let e = (2.0 * Expr::var("x")).sin().diff("x");
        let v = e.eval_points(&points()).unwrap();
        for (x, got) in [0.0f64, 0.5, 1.0].iter().zip(v) {
            assert!((got as f64 - 2.0 * (2.0 * x).cos()).abs() < 1e-6);
        }
    }

    #[test]
    fn constants_fold_and_broadcast() {
        let e = Expr::c(2.0) * Expr::c(3.0) + 0.0;
        assert_eq!(e, Expr::Const(6.0));
        assert_eq!(e.eval_points(&points()).unwrap(), vec![6.0; 3]);
        assert_eq!(Expr::var("x") * 0.0, Expr::Const(0.0));
        assert_eq!(-(-Expr::var("x")), Expr::var("x"));
    }

    #[test]
    fn beam_solution_matches_closed_form() {
        let x = Expr::var("x");
        let u = -(x.clone().powi(4)) / 24.0 + x.clone().powi(3) / 6.0 - x.powi(2) / 4.0;
        let v = u.eval_points(&points()).unwrap();
        assert_eq!(v[0], 0.0);
        let expected_end = -1.0 / 24.0 + 1.0 / 6.0 - 1.0 / 4.0;
        assert!((v[2] as f64 - expected_end).abs() < 1e-7);
    }

    #[test]
    fn rows_and_unknown_fields() {
        let e = Expr::var("x").rows(1..3);
        assert_eq!(e.row_range(), Some(1..3));
        assert_eq!(e.eval_points(&points()).unwrap(), vec![0.5, 1.0]);
        assert!(matches!(
            Expr::var("x").rows(2..5).eval_points(&points()),
            Err(PinnError::Shape(_))
        ));
        assert!(matches!(
            Expr::var("u").eval_points(&points()),
            Err(PinnError::UnknownField(_))
        ));
        assert!(matches!(
            Expr::jacobian("u", "x").eval_points(&points()),
            Err(PinnError::UnsupportedDerivative(_))
        ));
    }

    #[test]
    fn fields_include_derivative_variables() {
        let e = Expr::deriv("u", &["x", "y"]) + Expr::var("t");
        let f: Vec<String> = e.fields().into_iter().collect();
        assert_eq!(f, vec!["t", "u", "x", "y"]);
    }
}
