//! モデル・オプティマイザ・学習状態の保存と復元。
//!
//! `<output_dir>/checkpoints/` に次のファイルを置きます。
//!
//! - `<name>.mpk`        モデルの重み
//! - `<name>_optim.mpk`  オプティマイザの状態
//! - `<name>_states.json` エポック数とベスト指標

use crate::error::{PinnError, Result};
use crate::model::Mlp;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// 再開に必要な学習の進み具合。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// 学習を終えた最後のエポック
    pub epoch: usize,
    /// これまでで最良の評価指標（小さいほど良い）
    pub best_metric: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: output_dir.as_ref().join("checkpoints"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 拡張子なしのパス。`.mpk` は recorder が付けます。
    pub fn model_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn optimizer_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}_optim"))
    }

    fn states_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}_states.json"))
    }

    pub fn save_model<B: Backend>(&self, model: &Mlp<B>, name: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.model_path(name);
        model
            .clone()
            .save_file(path.clone(), &ModelRecorder::new())
            .map_err(|e| PinnError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        tracing::debug!("モデルを保存しました: {}.mpk", path.display());
        Ok(())
    }

    pub fn load_model<B: Backend>(
        &self,
        model: Mlp<B>,
        name: &str,
        device: &B::Device,
    ) -> Result<Mlp<B>> {
        load_model_file(model, &self.model_path(name), device)
    }

    pub fn save_optimizer<B, O>(&self, optim: &O, name: &str) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<Mlp<B>, B>,
    {
        fs::create_dir_all(&self.dir)?;
        let path = self.optimizer_path(name);
        Recorder::<B>::record(&ModelRecorder::new(), optim.to_record(), path.clone())
            .map_err(|e| PinnError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn load_optimizer<B, O>(&self, optim: O, name: &str, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        O: Optimizer<Mlp<B>, B>,
    {
        let path = self.optimizer_path(name);
        ensure_exists(&path.with_extension("mpk"))?;
        let record: O::Record = Recorder::<B>::load(&ModelRecorder::new(), path.clone(), device)
            .map_err(|e| PinnError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        Ok(optim.load_record(record))
    }

    pub fn save_states(&self, state: &TrainingState, name: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.states_path(name), serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    pub fn load_states(&self, name: &str) -> Result<TrainingState> {
        let path = self.states_path(name);
        ensure_exists(&path)?;
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// モデル・オプティマイザ・状態をまとめて保存します。
    pub fn save_all<B, O>(
        &self,
        model: &Mlp<B>,
        optim: &O,
        state: &TrainingState,
        name: &str,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<Mlp<B>, B>,
    {
        self.save_model(model, name)?;
        self.save_optimizer::<B, O>(optim, name)?;
        self.save_states(state, name)
    }
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PinnError::Checkpoint(format!(
            "ファイル '{}' が見つかりません",
            path.display()
        )))
    }
}

fn load_model_file<B: Backend>(model: Mlp<B>, path: &Path, device: &B::Device) -> Result<Mlp<B>> {
    ensure_exists(&path.with_extension("mpk"))?;
    model
        .load_file(path.to_path_buf(), &ModelRecorder::new(), device)
        .map_err(|e| PinnError::Checkpoint(format!("{}: {}", path.display(), e)))
}

/// `<dir>/<name>` 形式のチェックポイントからモデル・オプティマイザ・状態を復元します。
pub fn resume<B, O>(
    path: impl AsRef<Path>,
    model: Mlp<B>,
    optim: O,
    device: &B::Device,
) -> Result<(Mlp<B>, O, TrainingState)>
where
    B: AutodiffBackend,
    O: Optimizer<Mlp<B>, B>,
{
    let path = path.as_ref();
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            PinnError::Checkpoint(format!("不正なチェックポイントのパス: {}", path.display()))
        })?;
    let manager = CheckpointManager {
        dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let model = manager.load_model(model, name, device)?;
    let optim = manager.load_optimizer(optim, name, device)?;
    let state = manager.load_states(name)?;
    tracing::info!(
        "チェックポイント '{}' から再開します（エポック {} まで完了）",
        path.display(),
        state.epoch
    );
    Ok((model, optim, state))
}

/// 学習済みの重みを読み込みます。`path` の `.mpk` は省略できます。
pub fn load_pretrain<B: Backend>(
    model: Mlp<B>,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Mlp<B>> {
    let path = path.as_ref();
    let stem = if path.extension().is_some_and(|e| e == "mpk") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };
    let model = load_model_file(model, &stem, device)?;
    tracing::info!("学習済みモデルを読み込みました: {}.mpk", stem.display());
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::{AdamConfig, GradientsParams};
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("pinnkit_ckpt_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn config() -> MlpConfig {
        MlpConfig::new(vec!["x".into()], vec!["u".into()])
    }

    #[test]
    fn model_round_trip_restores_predictions() {
        let device = Default::default();
        let dir = temp_dir("model");
        let manager = CheckpointManager::new(&dir);
        let model = config().init::<TestBackend>(&device).unwrap();
        manager.save_model(&model, "best_model").unwrap();
        assert!(dir.join("checkpoints/best_model.mpk").exists());

        let fresh = config().init::<TestBackend>(&device).unwrap();
        let loaded = manager.load_model(fresh, "best_model", &device).unwrap();
        let x = Tensor::<TestBackend, 2>::from_floats([[0.3], [0.7]], &device);
        let a = model.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let b = loaded.forward(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);

        let again = load_pretrain(
            config().init::<TestBackend>(&device).unwrap(),
            dir.join("checkpoints/best_model.mpk"),
            &device,
        );
        assert!(again.is_ok());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_files_name_the_path() {
        let device = Default::default();
        let manager = CheckpointManager::new(temp_dir("missing"));
        let model = config().init::<TestBackend>(&device).unwrap();
        match manager.load_model(model, "latest", &device) {
            Err(PinnError::Checkpoint(msg)) => assert!(msg.contains("latest.mpk")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(manager.load_states("latest"), Err(PinnError::Checkpoint(_))));
    }

    #[test]
    fn optimizer_and_states_round_trip() {
        let device = Default::default();
        let dir = temp_dir("optim");
        let manager = CheckpointManager::new(&dir);
        let model = config().init::<TestAutodiffBackend>(&device).unwrap();
        let mut optim = AdamConfig::new().init::<TestAutodiffBackend, Mlp<TestAutodiffBackend>>();

        let x = Tensor::<TestAutodiffBackend, 2>::from_floats([[0.5]], &device);
        let loss = model.forward(x).powf_scalar(2.0).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optim.step(1e-3, model, grads);

        let state = TrainingState {
            epoch: 3,
            best_metric: Some(0.25),
        };
        manager.save_all(&model, &optim, &state, "latest").unwrap();
        assert_eq!(manager.load_states("latest").unwrap(), state);

        let fresh = AdamConfig::new().init::<TestAutodiffBackend, Mlp<TestAutodiffBackend>>();
        assert!(manager.load_optimizer(fresh, "latest", &device).is_ok());

        let (_, _, resumed) = resume(
            dir.join("checkpoints/latest"),
            config().init::<TestAutodiffBackend>(&device).unwrap(),
            AdamConfig::new().init::<TestAutodiffBackend, Mlp<TestAutodiffBackend>>(),
            &device,
        )
        .unwrap();
        assert_eq!(resumed.epoch, 3);
        fs::remove_dir_all(&dir).ok();
    }
}
