use serde::{Deserialize, Serialize};

/// 予測とラベルの比較指標。値が小さいほど良い指標だけを扱います。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// 相対 L2 誤差 `‖p − l‖₂ / ‖l‖₂`
    L2Rel,
    Mse,
    Rmse,
    Mae,
}

impl Metric {
    pub fn compute(&self, pred: &[f32], label: &[f32]) -> f64 {
        let n = pred.len().min(label.len());
        if n == 0 {
            return 0.0;
        }
        let diff = pred.iter().zip(label).map(|(&p, &l)| p as f64 - l as f64);
        match self {
            Metric::L2Rel => {
                let num: f64 = diff.map(|d| d * d).sum::<f64>().sqrt();
                let den: f64 = label.iter().map(|&l| (l as f64).powi(2)).sum::<f64>().sqrt();
                num / den.max(f32::EPSILON as f64)
            }
            Metric::Mse => diff.map(|d| d * d).sum::<f64>() / n as f64,
            Metric::Rmse => (diff.map(|d| d * d).sum::<f64>() / n as f64).sqrt(),
            Metric::Mae => diff.map(f64::abs).sum::<f64>() / n as f64,
        }
    }
}
