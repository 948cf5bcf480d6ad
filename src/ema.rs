//! 重みの指数移動平均 (EMA)。
//!
//! 学習中のモデルとは別に平均化した重みを持ち、評価やベストモデルの保存に使います。

use crate::checkpoint;
use crate::error::{PinnError, Result};
use crate::model::Mlp;
use burn::module::Param;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::path::Path;

/// `shadow ← decay·shadow + (1 − decay)·param` で更新される重みの平均。
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage<B: Backend> {
    decay: f64,
    shadow: Mlp<B>,
    num_updates: usize,
}

fn blend<B: Backend, const D: usize>(
    shadow: Param<Tensor<B, D>>,
    current: &Param<Tensor<B, D>>,
    decay: f64,
) -> Param<Tensor<B, D>> {
    let value = shadow
        .val()
        .mul_scalar(decay)
        .add(current.val().mul_scalar(1.0 - decay));
    Param::initialized(shadow.id, value)
}

impl<B: Backend> ExponentialMovingAverage<B> {
    /// `model` の現在の重みで平均を初期化します。`decay` は `(0, 1)` の範囲です。
    pub fn new(model: Mlp<B>, decay: f64) -> Result<Self> {
        if !(decay > 0.0 && decay < 1.0) {
            return Err(PinnError::Config(format!(
                "EMA の減衰率は 0 より大きく 1 未満にしてください: {decay}"
            )));
        }
        Ok(Self {
            decay,
            shadow: model,
            num_updates: 0,
        })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// 平均化した重みを持つモデル。
    pub fn model(&self) -> &Mlp<B> {
        &self.shadow
    }

    /// オプティマイザの1ステップ後に呼びます。
    pub fn update(&mut self, model: &Mlp<B>) {
        let decay = self.decay;
        let layers = std::mem::take(&mut self.shadow.linears);
        self.shadow.linears = layers
            .into_iter()
            .zip(&model.linears)
            .map(|(mut s, c)| {
                s.weight = blend(s.weight, &c.weight, decay);
                s.bias = match (s.bias, &c.bias) {
                    (Some(sb), Some(cb)) => Some(blend(sb, cb, decay)),
                    (sb, _) => sb,
                };
                s
            })
            .collect();
        self.num_updates += 1;
    }

    /// `<path>.mpk` があれば平均化した重みを読み込みます。無ければ現在の値のままです。
    pub fn load_if_exists(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        if path.with_extension("mpk").exists() {
            self.shadow = checkpoint::load_pretrain(self.shadow, path, device)?;
        } else {
            tracing::warn!(
                "EMA の重み '{}.mpk' が無いため、現在のモデルから平均を始めます",
                path.display()
            );
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn model() -> Mlp<TestBackend> {
        MlpConfig::new(vec!["x".into()], vec!["u".into()])
            .with_num_layers(1)
            .with_hidden_size(4)
            .init(&Default::default())
            .unwrap()
    }

    fn weights(model: &Mlp<TestBackend>) -> Vec<f32> {
        model
            .linears
            .iter()
            .flat_map(|l| {
                let mut w = l.weight.val().into_data().to_vec::<f32>().unwrap();
                if let Some(b) = &l.bias {
                    w.extend(b.val().into_data().to_vec::<f32>().unwrap());
                }
                w
            })
            .collect()
    }

    #[test]
    fn update_moves_shadow_towards_current_weights() {
        let start = model();
        let current = model();
        let mut ema = ExponentialMovingAverage::new(start.clone(), 0.75).unwrap();
        ema.update(&current);
        assert_eq!(ema.num_updates(), 1);

        let expected: Vec<f32> = weights(&start)
            .iter()
            .zip(weights(&current))
            .map(|(s, c)| 0.75 * s + 0.25 * c)
            .collect();
        for (a, b) in weights(ema.model()).iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }

    #[test]
    fn repeated_updates_converge_to_fixed_weights() {
        let current = model();
        let mut ema = ExponentialMovingAverage::new(model(), 0.5).unwrap();
        for _ in 0..40 {
            ema.update(&current);
        }
        for (a, b) in weights(ema.model()).iter().zip(weights(&current)) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn decay_outside_unit_interval_is_rejected() {
        for decay in [0.0, 1.0, -0.1, f64::NAN] {
            assert!(matches!(
                ExponentialMovingAverage::new(model(), decay),
                Err(PinnError::Config(_))
            ));
        }
    }
}
