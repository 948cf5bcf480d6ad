use crate::error::{PinnError, Result};
use burn::nn::loss::{MseLoss, Reduction as BurnReduction};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

impl From<Reduction> for BurnReduction {
    fn from(r: Reduction) -> Self {
        match r {
            Reduction::Mean => BurnReduction::Mean,
            Reduction::Sum => BurnReduction::Sum,
        }
    }
}

/// 出力とラベルの差から損失を計算する関数。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Loss {
    /// 二乗誤差
    Mse(Reduction),
    /// 絶対誤差
    L1(Reduction),
    /// 差の L2 ノルム
    L2,
}

impl Default for Loss {
    fn default() -> Self {
        Loss::Mse(Reduction::Mean)
    }
}

impl Loss {
    /// キーごとの損失に重み（既定 1）を掛けて合計します。
    pub fn compute<B: Backend>(
        &self,
        outputs: &BTreeMap<String, Tensor<B, 2>>,
        labels: &BTreeMap<String, Tensor<B, 2>>,
        weights: &BTreeMap<String, f32>,
    ) -> Result<Tensor<B, 1>> {
        let mut total: Option<Tensor<B, 1>> = None;
        for (key, output) in outputs {
            let label = labels
                .get(key)
                .ok_or_else(|| PinnError::UnknownField(format!("{key}（ラベル）")))?;
            if output.dims() != label.dims() {
                return Err(PinnError::Shape(format!(
                    "'{}' の出力 {:?} とラベル {:?} の形状が一致しません",
                    key,
                    output.dims(),
                    label.dims()
                )));
            }
            let mut loss = self.single(output.clone(), label.clone());
            if let Some(&w) = weights.get(key) {
                loss = loss.mul_scalar(w);
            }
            total = Some(match total {
                Some(t) => t + loss,
                None => loss,
            });
        }
        total.ok_or_else(|| PinnError::Config("損失を計算する出力がありません".to_string()))
    }

    fn single<B: Backend>(&self, output: Tensor<B, 2>, label: Tensor<B, 2>) -> Tensor<B, 1> {
        match self {
            Loss::Mse(r) => MseLoss::new().forward(output, label, (*r).into()),
            Loss::L1(Reduction::Mean) => (output - label).abs().mean(),
            Loss::L1(Reduction::Sum) => (output - label).abs().sum(),
            Loss::L2 => (output - label).powf_scalar(2.0).sum().sqrt(),
        }
    }
}
