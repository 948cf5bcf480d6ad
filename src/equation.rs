//! 偏微分方程式の残差定義。

use crate::error::{PinnError, Result};
use crate::expr::Expr;
use std::collections::BTreeMap;
use std::fmt::Debug;

const AXES: [&str; 3] = ["x", "y", "z"];

fn axes(dim: usize) -> Result<&'static [&'static str]> {
    if !(1..=3).contains(&dim) {
        return Err(PinnError::Config(format!(
            "次元は 1 から 3 の範囲で指定してください: {dim}"
        )));
    }
    Ok(&AXES[..dim])
}

/// 名前付きの残差式を持つ偏微分方程式。
///
/// 各残差は学習で 0 に近づけられる量です。
pub trait Pde: Debug {
    fn name(&self) -> &str;

    fn equations(&self) -> BTreeMap<String, Expr>;
}

/// 重調和方程式 `D·∇⁴u = q`。
///
/// 1次元ではオイラー・ベルヌーイ梁のたわみ方程式になります。
#[derive(Debug, Clone)]
pub struct Biharmonic {
    dim: usize,
    q: f64,
    d: f64,
}

impl Biharmonic {
    pub fn new(dim: usize, q: f64, d: f64) -> Result<Self> {
        axes(dim)?;
        Ok(Self { dim, q, d })
    }
}

impl Pde for Biharmonic {
    fn name(&self) -> &str {
        "biharmonic"
    }

    fn equations(&self) -> BTreeMap<String, Expr> {
        let vars = &AXES[..self.dim];
        let mut residual = Expr::c(-self.q);
        for &i in vars {
            for &j in vars {
                residual = residual + self.d * Expr::deriv("u", &[i, i, j, j]);
            }
        }
        BTreeMap::from([("biharmonic".to_string(), residual)])
    }
}

/// ラプラス方程式 `∇²u = 0`。
#[derive(Debug, Clone)]
pub struct Laplace {
    dim: usize,
}

impl Laplace {
    pub fn new(dim: usize) -> Result<Self> {
        axes(dim)?;
        Ok(Self { dim })
    }
}

impl Pde for Laplace {
    fn name(&self) -> &str {
        "laplace"
    }

    fn equations(&self) -> BTreeMap<String, Expr> {
        let residual = AXES[..self.dim]
            .iter()
            .fold(Expr::c(0.0), |acc, v| acc + Expr::hessian("u", v));
        BTreeMap::from([("laplace".to_string(), residual)])
    }
}

/// ポアソン方程式の左辺 `∇²p`。右辺はラベル側で与えます。
#[derive(Debug, Clone)]
pub struct Poisson {
    dim: usize,
}

impl Poisson {
    pub fn new(dim: usize) -> Result<Self> {
        axes(dim)?;
        Ok(Self { dim })
    }
}

impl Pde for Poisson {
    fn name(&self) -> &str {
        "poisson"
    }

    fn equations(&self) -> BTreeMap<String, Expr> {
        let residual = AXES[..self.dim]
            .iter()
            .fold(Expr::c(0.0), |acc, v| acc + Expr::hessian("p", v));
        BTreeMap::from([("poisson".to_string(), residual)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beam_equation_is_fourth_derivative_plus_load() {
        let eq = Biharmonic::new(1, -1.0, 1.0).unwrap().equations();
        let expected = Expr::c(1.0) + Expr::deriv("u", &["x", "x", "x", "x"]);
        assert_eq!(eq["biharmonic"], expected);
    }

    #[test]
    fn biharmonic_2d_has_mixed_terms() {
        let eq = Biharmonic::new(2, 0.0, 2.0).unwrap().equations();
        let text = eq["biharmonic"].to_string();
        assert!(text.contains("u__x__x__y__y"));
        assert!(text.contains("u__y__y__x__x"));
        assert!(text.contains("u__y__y__y__y"));
    }

    #[test]
    fn laplace_sums_second_derivatives() {
        let eq = Laplace::new(2).unwrap().equations();
        assert_eq!(
            eq["laplace"],
            Expr::hessian("u", "x") + Expr::hessian("u", "y")
        );
        assert!(Laplace::new(0).is_err());
        assert!(Poisson::new(4).is_err());
    }
}
