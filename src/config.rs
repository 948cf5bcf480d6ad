//! 学習ループの設定。

use crate::error::{PinnError, Result};
use crate::model::Mlp;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// エポックに応じた学習率の変化。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `step_size` エポックごとに `gamma` 倍
    Step { step_size: usize, gamma: f64 },
    /// 毎エポック `gamma` 倍
    Exponential { gamma: f64 },
}

/// Adam の設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    pub weight_decay: Option<f32>,
    pub schedule: LrSchedule,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
            weight_decay: None,
            schedule: LrSchedule::Constant,
        }
    }
}

impl OptimizerConfig {
    /// 1 始まりの `epoch` での学習率。
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let k = epoch.saturating_sub(1);
        match self.schedule {
            LrSchedule::Constant => self.learning_rate,
            LrSchedule::Step { step_size, gamma } => {
                self.learning_rate * gamma.powi((k / step_size.max(1)) as i32)
            }
            LrSchedule::Exponential { gamma } => self.learning_rate * gamma.powi(k as i32),
        }
    }

    pub fn init<B: AutodiffBackend>(&self) -> OptimizerAdaptor<Adam, Mlp<B>, B> {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon)
            .with_weight_decay(self.weight_decay.map(WeightDecayConfig::new))
            .init()
    }
}

/// 重みの指数移動平均の設定。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaConfig {
    /// `(0, 1)` の減衰率。1 に近いほどゆっくり追従します
    pub decay: f64,
}

/// ソルバの設定。JSON ファイルから読み込めます（省略した項目は既定値）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub output_dir: PathBuf,
    pub epochs: usize,
    pub iters_per_epoch: usize,
    pub eval_during_train: bool,
    pub eval_freq: usize,
    /// 0 なら `epoch_<n>` を保存しない
    pub save_freq: usize,
    pub log_freq: usize,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
    pub pretrained_model_path: Option<PathBuf>,
    /// 再開に使うチェックポイント名（`latest` など）のパス
    pub checkpoint_path: Option<PathBuf>,
    /// 指定すると評価とベストモデルの判定に平均化した重みを使う
    pub ema: Option<EmaConfig>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            epochs: 1,
            iters_per_epoch: 1,
            eval_during_train: false,
            eval_freq: 1,
            save_freq: 0,
            log_freq: 20,
            seed: 42,
            optimizer: OptimizerConfig::default(),
            pretrained_model_path: None,
            checkpoint_path: None,
            ema: None,
        }
    }
}

impl SolverConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PinnError::Config(format!("設定ファイル '{}' を読めません: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("epochs", self.epochs),
            ("iters_per_epoch", self.iters_per_epoch),
            ("eval_freq", self.eval_freq),
        ] {
            if value == 0 {
                return Err(PinnError::Config(format!("{name} は 1 以上にしてください")));
            }
        }
        if self.optimizer.learning_rate <= 0.0 {
            return Err(PinnError::Config(format!(
                "学習率は正の値にしてください: {}",
                self.optimizer.learning_rate
            )));
        }
        if let Some(ema) = self.ema {
            if !(ema.decay > 0.0 && ema.decay < 1.0) {
                return Err(PinnError::Config(format!(
                    "EMA の減衰率は 0 より大きく 1 未満にしてください: {}",
                    ema.decay
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules() {
        let mut opt = OptimizerConfig::default();
        assert_eq!(opt.lr_at(100), 1e-3);

        opt.schedule = LrSchedule::Step {
            step_size: 10,
            gamma: 0.5,
        };
        assert_eq!(opt.lr_at(1), 1e-3);
        assert_eq!(opt.lr_at(10), 1e-3);
        assert_eq!(opt.lr_at(11), 5e-4);

        opt.schedule = LrSchedule::Exponential { gamma: 0.9 };
        assert!((opt.lr_at(3) - 1e-3 * 0.81).abs() < 1e-15);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SolverConfig = serde_json::from_str(
            r#"{"epochs": 5, "optimizer": {"learning_rate": 0.01,
                "schedule": {"exponential": {"gamma": 0.95}}}}"#,
        )
        .unwrap();
        assert_eq!(config.epochs, 5);
        assert_eq!(config.iters_per_epoch, 1);
        assert_eq!(config.optimizer.learning_rate, 0.01);
        assert_eq!(config.optimizer.beta_2, 0.999);
        assert_eq!(config.optimizer.schedule, LrSchedule::Exponential { gamma: 0.95 });
    }

    #[test]
    fn zero_counts_are_rejected() {
        let mut config = SolverConfig::default();
        assert!(config.validate().is_ok());
        config.eval_freq = 0;
        assert!(matches!(config.validate(), Err(PinnError::Config(_))));
    }

    #[test]
    fn ema_decay_is_checked() {
        let config: SolverConfig = serde_json::from_str(r#"{"ema": {"decay": 0.99}}"#).unwrap();
        assert_eq!(config.ema, Some(EmaConfig { decay: 0.99 }));
        assert!(config.validate().is_ok());

        let config = SolverConfig {
            ema: Some(EmaConfig { decay: 1.0 }),
            ..SolverConfig::default()
        };
        assert!(matches!(config.validate(), Err(PinnError::Config(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            SolverConfig::from_file("/nonexistent/pinnkit.json"),
            Err(PinnError::Config(_))
        ));
    }
}
