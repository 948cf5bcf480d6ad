// `Config` の derive が素の `Result` を使うため、別名はここでは import しない
use crate::error::PinnError;
use crate::jet;
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

/// 隠れ層の活性化関数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    Tanh,
    Sin,
}

impl Activation {
    pub fn forward<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Sin => x.sin(),
        }
    }

    /// `z` における 0 階から `n` 階までの導関数値 `f(z), f'(z), ..., f⁽ⁿ⁾(z)`。
    pub(crate) fn derivatives<B: Backend>(&self, z: Tensor<B, 2>, n: usize) -> Vec<Tensor<B, 2>> {
        match self {
            Activation::Tanh => {
                let s = z.tanh();
                tanh_derivative_polys(n)
                    .iter()
                    .map(|p| polyval(p, &s))
                    .collect()
            }
            Activation::Sin => {
                let sin = z.clone().sin();
                let cos = z.cos();
                (0..=n)
                    .map(|k| match k % 4 {
                        0 => sin.clone(),
                        1 => cos.clone(),
                        2 => sin.clone().neg(),
                        _ => cos.clone().neg(),
                    })
                    .collect()
            }
        }
    }
}

/// `tanh` の k 階導関数を `s = tanh(z)` の多項式として表した係数列（低次から）。
///
/// `P₀(s) = s`, `Pₖ₊₁(s) = Pₖ'(s)·(1 − s²)`
fn tanh_derivative_polys(n: usize) -> Vec<Vec<f64>> {
    let mut polys = vec![vec![0.0, 1.0]];
    for _ in 0..n {
        let p = polys.last().map(Vec::as_slice).unwrap_or(&[]);
        let dp: Vec<f64> = (1..p.len()).map(|i| i as f64 * p[i]).collect();
        let mut next = vec![0.0; dp.len() + 2];
        for (i, c) in dp.iter().enumerate() {
            next[i] += c;
            next[i + 2] -= c;
        }
        polys.push(next);
    }
    polys
}

fn polyval<B: Backend>(coeffs: &[f64], s: &Tensor<B, 2>) -> Tensor<B, 2> {
    let mut iter = coeffs.iter().rev();
    let top = iter.next().copied().unwrap_or(0.0);
    let mut acc = Tensor::zeros_like(s).add_scalar(top);
    for &c in iter {
        acc = acc.mul(s.clone()).add_scalar(c);
    }
    acc
}

/// 多層パーセプトロンの設定。
#[derive(Config, Debug)]
pub struct MlpConfig {
    /// 入力フィールド名（列の並び順）
    pub input_keys: Vec<String>,
    /// 出力フィールド名
    pub output_keys: Vec<String>,
    /// 隠れ層の数
    #[config(default = 3)]
    pub num_layers: usize,
    #[config(default = 20)]
    pub hidden_size: usize,
    #[config(default = "Activation::Tanh")]
    pub activation: Activation,
}

impl MlpConfig {
    /// 新しいモデルを初期化します。重みは Xavier 正規分布で初期化します。
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<Mlp<B>> {
        if self.input_keys.is_empty() || self.output_keys.is_empty() {
            return Err(PinnError::Config(
                "入力・出力フィールドは1つ以上必要です".to_string(),
            ));
        }
        if self.num_layers == 0 || self.hidden_size == 0 {
            return Err(PinnError::Config(format!(
                "隠れ層の数と幅は正である必要があります (num_layers={}, hidden_size={})",
                self.num_layers, self.hidden_size
            )));
        }
        let initializer = Initializer::XavierNormal { gain: 1.0 };
        let mut linears = Vec::with_capacity(self.num_layers + 1);
        let mut d_in = self.input_keys.len();
        for _ in 0..self.num_layers {
            linears.push(
                LinearConfig::new(d_in, self.hidden_size)
                    .with_initializer(initializer.clone())
                    .init(device),
            );
            d_in = self.hidden_size;
        }
        linears.push(
            LinearConfig::new(d_in, self.output_keys.len())
                .with_initializer(initializer)
                .init(device),
        );
        Ok(Mlp {
            linears,
            activation: Ignored(self.activation),
            input_keys: Ignored(self.input_keys.clone()),
            output_keys: Ignored(self.output_keys.clone()),
        })
    }
}

/// PINN の本体となる全結合ネットワーク。
///
/// 名前付き入力（座標など）の列を連結した `[N, 入力数]` を受け取り、
/// 名前付き出力の列を並べた `[N, 出力数]` を返します。
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub(crate) linears: Vec<Linear<B>>,
    activation: Ignored<Activation>,
    input_keys: Ignored<Vec<String>>,
    output_keys: Ignored<Vec<String>>,
}

impl<B: Backend> Mlp<B> {
    pub fn input_keys(&self) -> &[String] {
        &self.input_keys.0
    }

    pub fn output_keys(&self) -> &[String] {
        &self.output_keys.0
    }

    pub fn activation(&self) -> Activation {
        self.activation.0
    }

    /// 順伝播。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.linears.len() - 1;
        let mut x = input;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i < last {
                x = self.activation.0.forward(x);
            }
        }
        x
    }

    /// 入力を `direction` 方向に動かしたときの出力の 0 階から `order` 階までの微分。
    ///
    /// 戻り値の k 番目は `dᵏ/dtᵏ f(x + t·direction)` で、形状は `[N, 出力数]` です。
    pub fn forward_jet(
        &self,
        input: Tensor<B, 2>,
        direction: &[f32],
        order: usize,
    ) -> crate::error::Result<Vec<Tensor<B, 2>>> {
        let [n, d] = input.dims();
        if direction.len() != d {
            return Err(PinnError::Shape(format!(
                "方向ベクトルの次元 {} が入力の次元 {} と一致しません",
                direction.len(),
                d
            )));
        }
        let device = input.device();
        let tangent: Vec<f32> = (0..n).flat_map(|_| direction.iter().copied()).collect();
        let mut z = Vec::with_capacity(order + 1);
        z.push(input.clone());
        if order >= 1 {
            z.push(Tensor::from_data(TensorData::new(tangent, [n, d]), &device));
        }
        for _ in 2..=order {
            z.push(Tensor::zeros_like(&input));
        }

        let last = self.linears.len() - 1;
        for (i, linear) in self.linears.iter().enumerate() {
            z = jet::linear_jet(linear, z);
            if i < last {
                let fd = self.activation.0.derivatives(z[0].clone(), order);
                z = jet::compose(&fd, &z);
            }
        }
        Ok(z)
    }

    /// 学習可能なパラメータ数。
    pub fn num_parameters(&self) -> usize {
        self.num_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn tanh_polynomials_match_closed_form() {
        let p = tanh_derivative_polys(4);
        assert_eq!(p[1], vec![1.0, 0.0, -1.0]);
        assert_eq!(p[2], vec![0.0, -2.0, 0.0, 2.0]);
        // f''' = -2 + 8s² - 6s⁴
        assert_eq!(p[3], vec![-2.0, 0.0, 8.0, 0.0, -6.0]);
        // f'''' = 16s - 40s³ + 24s⁵
        assert_eq!(p[4], vec![0.0, 16.0, 0.0, -40.0, 0.0, 24.0]);
    }

    #[test]
    fn layer_count_and_output_shape() {
        let device = Default::default();
        let model = MlpConfig::new(vec!["x".into(), "y".into()], vec!["u".into()])
            .with_num_layers(3)
            .with_hidden_size(20)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(model.linears.len(), 4);
        // 2*20+20 + 2*(20*20+20) + 20*1+1
        assert_eq!(model.num_parameters(), 60 + 840 + 21);
        let out = model.forward(Tensor::zeros([7, 2], &device));
        assert_eq!(out.dims(), [7, 1]);
    }

    #[test]
    fn config_file_round_trip_keeps_layout() {
        let path = std::env::temp_dir().join(format!("pinnkit_mlp_{}.json", std::process::id()));
        let config = MlpConfig::new(vec!["x".into()], vec!["u".into()])
            .with_num_layers(2)
            .with_hidden_size(8)
            .with_activation(Activation::Sin);
        config.save(&path).unwrap();
        let loaded = MlpConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.num_layers, 2);
        assert_eq!(loaded.hidden_size, 8);
        assert_eq!(loaded.activation, Activation::Sin);
        let model = loaded.init::<TestBackend>(&Default::default()).unwrap();
        assert_eq!(model.linears.len(), 3);
        assert_eq!(model.activation(), Activation::Sin);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = Default::default();
        let r = MlpConfig::new(vec![], vec!["u".into()]).init::<TestBackend>(&device);
        assert!(matches!(r, Err(PinnError::Config(_))));
        let r = MlpConfig::new(vec!["x".into()], vec!["u".into()])
            .with_num_layers(0)
            .init::<TestBackend>(&device);
        assert!(matches!(r, Err(PinnError::Config(_))));
    }

    #[test]
    fn jet_order_zero_equals_forward() {
        let device = Default::default();
        let model = MlpConfig::new(vec!["x".into()], vec!["u".into(), "v".into()])
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 1>::from_floats([0.1, 0.4, 0.9], &device).reshape([3, 1]);
        let jet = model.forward_jet(x.clone(), &[1.0], 2).unwrap();
        assert_eq!(jet.len(), 3);
        let a = jet[0].clone().into_data().to_vec::<f32>().unwrap();
        let b = model.forward(x).into_data().to_vec::<f32>().unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-6);
        }
        assert!(model.forward_jet(Tensor::zeros([3, 2], &device), &[1.0], 1).is_err());
    }
}
