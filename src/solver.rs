//! 学習・評価・可視化をまとめて行うソルバ。

use crate::checkpoint::{self, CheckpointManager, TrainingState};
use crate::config::SolverConfig;
use crate::constraint::Constraint;
use crate::data::{PointSet, save_csv_file};
use crate::ema::ExponentialMovingAverage;
use crate::equation::Pde;
use crate::error::{PinnError, Result};
use crate::expr::Expr;
use crate::misc::AverageMeter;
use crate::model::Mlp;
use crate::validate::{ValidationReport, Validator};
use crate::visualize::{Visualizer, plot_loss_history};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// 学習の結果。
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// 最後に学習したエポック
    pub last_epoch: usize,
    /// 最終エポックの平均損失
    pub final_loss: f64,
    pub best_metric: Option<f64>,
    /// `loss` と各制約のエポック平均損失
    pub history: Vec<(String, Vec<f64>)>,
    /// 各エポックでオプティマイザに渡した学習率
    pub learning_rates: Vec<f64>,
}

/// [`Solver`] の組み立て。
pub struct SolverBuilder<B: AutodiffBackend> {
    model: Mlp<B>,
    config: SolverConfig,
    constraints: Vec<Constraint>,
    validators: Vec<Validator>,
    visualizers: Vec<(String, Visualizer)>,
    equations: Vec<Box<dyn Pde>>,
}

impl<B: AutodiffBackend> SolverBuilder<B> {
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn visualizer(mut self, name: impl Into<String>, visualizer: Visualizer) -> Self {
        self.visualizers.push((name.into(), visualizer));
        self
    }

    /// 記録用。残差式そのものは制約の出力式として渡します。
    pub fn equation(mut self, pde: impl Pde + 'static) -> Self {
        self.equations.push(Box::new(pde));
        self
    }

    pub fn build(self, device: &B::Device) -> Result<Solver<B>> {
        self.config.validate()?;
        unique_names("制約", self.constraints.iter().map(|c| c.name()))?;
        unique_names("バリデータ", self.validators.iter().map(|v| v.name()))?;
        unique_names("可視化器", self.visualizers.iter().map(|(n, _)| n.as_str()))?;
        unique_names("方程式", self.equations.iter().map(|e| e.name()))?;
        for c in &self.constraints {
            if matches!(c.name(), "loss" | "epoch") {
                return Err(PinnError::Config(format!(
                    "制約名 '{}' は損失履歴の列名と重なるため使えません",
                    c.name()
                )));
            }
        }

        for c in &self.constraints {
            check_fields(&self.model, c.name(), c.points(), c.output_expr())?;
        }
        for v in &self.validators {
            check_fields(&self.model, v.name(), v.points(), v.output_expr())?;
        }
        for (name, v) in &self.visualizers {
            check_fields(&self.model, name, v.points(), v.output_expr())?;
        }
        for pde in &self.equations {
            for (name, expr) in pde.equations() {
                tracing::debug!("方程式 {}: {} = {}", pde.name(), name, expr);
            }
        }

        let mut model = self.model;
        if let Some(path) = &self.config.pretrained_model_path {
            model = checkpoint::load_pretrain(model, path, device)?;
        }
        tracing::info!(
            "ソルバを作成しました: パラメータ数 {}, 制約 {}, バリデータ {}, 可視化器 {}",
            model.num_parameters(),
            self.constraints.len(),
            self.validators.len(),
            self.visualizers.len()
        );

        Ok(Solver {
            checkpoints: CheckpointManager::new(&self.config.output_dir),
            rng: StdRng::seed_from_u64(self.config.seed),
            model,
            config: self.config,
            constraints: self.constraints,
            validators: self.validators,
            visualizers: self.visualizers,
            equations: self.equations,
            best_metric: None,
            ema: None,
            device: device.clone(),
        })
    }
}

fn unique_names<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(PinnError::Config(format!("{what}の名前 '{name}' が重複しています")));
        }
    }
    Ok(())
}

/// 出力式が参照する名前はモデルの入出力であり、入力は点群の列である必要がある。
fn check_fields<B: AutodiffBackend>(
    model: &Mlp<B>,
    owner: &str,
    points: &PointSet,
    exprs: &BTreeMap<String, Expr>,
) -> Result<()> {
    for key in model.input_keys() {
        if !points.contains(key) {
            return Err(PinnError::UnknownField(format!(
                "'{owner}' の点群にモデル入力 '{key}' の列がありません"
            )));
        }
    }
    for (out, expr) in exprs {
        for field in expr.fields() {
            let known =
                model.input_keys().contains(&field) || model.output_keys().contains(&field);
            if !known {
                return Err(PinnError::UnknownField(format!(
                    "'{owner}' の出力 '{out}' が参照する '{field}' はモデルの入出力ではありません"
                )));
            }
        }
    }
    Ok(())
}

/// モデルと制約・バリデータ・可視化器を束ねて学習を進めます。
pub struct Solver<B: AutodiffBackend> {
    model: Mlp<B>,
    config: SolverConfig,
    constraints: Vec<Constraint>,
    validators: Vec<Validator>,
    visualizers: Vec<(String, Visualizer)>,
    equations: Vec<Box<dyn Pde>>,
    checkpoints: CheckpointManager,
    rng: StdRng,
    best_metric: Option<f64>,
    ema: Option<ExponentialMovingAverage<B::InnerBackend>>,
    device: B::Device,
}

impl<B: AutodiffBackend> Solver<B> {
    pub fn builder(model: Mlp<B>, config: SolverConfig) -> SolverBuilder<B> {
        SolverBuilder {
            model,
            config,
            constraints: Vec::new(),
            validators: Vec::new(),
            visualizers: Vec::new(),
            equations: Vec::new(),
        }
    }

    pub fn model(&self) -> &Mlp<B> {
        &self.model
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    pub fn equations(&self) -> &[Box<dyn Pde>] {
        &self.equations
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// 学習中に作られた重みの移動平均。`ema` を設定していなければ `None`。
    pub fn ema(&self) -> Option<&ExponentialMovingAverage<B::InnerBackend>> {
        self.ema.as_ref()
    }

    /// 評価と可視化に使うモデル。移動平均があればそちらを使います。
    fn eval_model(&self) -> Mlp<B::InnerBackend> {
        match &self.ema {
            Some(ema) => ema.model().clone(),
            None => self.model.valid(),
        }
    }

    /// `save_all` に加え、移動平均があれば `<name>_ema.mpk` も保存します。
    fn save_checkpoint<O>(
        &self,
        model: &Mlp<B>,
        optim: &O,
        state: &TrainingState,
        name: &str,
    ) -> Result<()>
    where
        O: Optimizer<Mlp<B>, B>,
    {
        self.checkpoints.save_all(model, optim, state, name)?;
        if let Some(ema) = &self.ema {
            self.checkpoints.save_model(ema.model(), &format!("{name}_ema"))?;
        }
        Ok(())
    }

    /// 全制約の損失の和を最小化します。
    pub fn train(&mut self) -> Result<TrainSummary> {
        if self.constraints.is_empty() {
            return Err(PinnError::Config("学習する制約がありません".to_string()));
        }
        let epochs = self.config.epochs;
        let iters = self.config.iters_per_epoch;
        let log_freq = self.config.log_freq.max(1);

        let mut model = self.model.clone();
        let mut optim = self.config.optimizer.init::<B>();
        let mut start_epoch = 1;
        if let Some(path) = self.config.checkpoint_path.clone() {
            let (m, o, state) = checkpoint::resume(&path, model, optim, &self.device)?;
            model = m;
            optim = o;
            start_epoch = state.epoch + 1;
            self.best_metric = state.best_metric;
        }
        self.ema = match self.config.ema {
            Some(ema) => {
                let averaged = ExponentialMovingAverage::new(model.valid(), ema.decay)?;
                match &self.config.checkpoint_path {
                    Some(path) => Some(averaged.load_if_exists(&ema_path(path), &self.device)?),
                    None => Some(averaged),
                }
            }
            None => None,
        };

        let names: Vec<String> = self.constraints.iter().map(|c| c.name().to_string()).collect();
        let mut history: Vec<(String, Vec<f64>)> = std::iter::once("loss".to_string())
            .chain(names.iter().cloned())
            .map(|n| (n, Vec::new()))
            .collect();

        tracing::info!(
            "学習を開始します: エポック {}..={}, 1エポックあたり {} イテレーション",
            start_epoch,
            epochs,
            iters
        );
        let training_start = Instant::now();
        let mut final_loss = f64::NAN;
        let mut learning_rates = Vec::new();

        for epoch in start_epoch..=epochs {
            for c in &mut self.constraints {
                c.shuffle(&mut self.rng);
            }
            let lr = self.config.optimizer.lr_at(epoch);
            learning_rates.push(lr);
            let mut meters: Vec<AverageMeter> =
                history.iter().map(|(n, _)| AverageMeter::new(n.clone())).collect();
            let mut batch_cost = AverageMeter::new("batch_cost");

            for iter in 1..=iters {
                let iter_start = Instant::now();
                let mut total: Option<Tensor<B, 1>> = None;
                for (c, meter) in self.constraints.iter().zip(meters.iter_mut().skip(1)) {
                    let loss = c.compute_loss(&model, iter - 1, &self.device)?;
                    meter.update(loss.clone().into_scalar().elem::<f64>(), 1);
                    total = Some(match total {
                        Some(t) => t + loss,
                        None => loss,
                    });
                }
                let Some(total) = total else { break };
                let total_val = total.clone().into_scalar().elem::<f64>();
                if !total_val.is_finite() {
                    tracing::warn!(
                        "[Train][Epoch {epoch}][Iter {iter}] 損失が有限値ではありません: {total_val}"
                    );
                }
                meters[0].update(total_val, 1);

                let grads = GradientsParams::from_grads(total.backward(), &model);
                model = optim.step(lr, model, grads);
                if let Some(ema) = self.ema.as_mut() {
                    ema.update(&model.valid());
                }
                batch_cost.update(iter_start.elapsed().as_secs_f64(), 1);

                if iter % log_freq == 0 || iter == iters {
                    let parts: Vec<String> = meters
                        .iter()
                        .map(|m| format!("{}: {:.5e}", m.name, m.val))
                        .collect();
                    tracing::info!(
                        "[Train][Epoch {}/{}][Iter {}/{}] lr: {:.5e}, {}, batch_cost: {:.5}s",
                        epoch,
                        epochs,
                        iter,
                        iters,
                        lr,
                        parts.join(", "),
                        batch_cost.avg
                    );
                }
            }
            for ((_, series), meter) in history.iter_mut().zip(&meters) {
                series.push(meter.avg);
            }
            final_loss = meters[0].avg;

            if self.config.eval_during_train && epoch % self.config.eval_freq == 0 {
                self.model = model.clone();
                let reports = self.eval()?;
                if let Some(target) = target_metric(&self.validators, &reports) {
                    if self.best_metric.is_none_or(|best| target < best) {
                        self.best_metric = Some(target);
                        let state = TrainingState {
                            epoch,
                            best_metric: self.best_metric,
                        };
                        self.save_checkpoint(&model, &optim, &state, "best_model")?;
                        tracing::info!(
                            "[Eval][Epoch {epoch}] ベストモデルを更新しました: {target:.5e}"
                        );
                    }
                    tracing::info!(
                        "[Eval][Epoch {}] 現在のベスト: {:.5e}",
                        epoch,
                        self.best_metric.unwrap_or(target)
                    );
                }
            }

            if self.config.save_freq > 0 && epoch % self.config.save_freq == 0 {
                let state = TrainingState {
                    epoch,
                    best_metric: self.best_metric,
                };
                self.save_checkpoint(&model, &optim, &state, &format!("epoch_{epoch}"))?;
            }
        }

        let last_epoch = epochs.max(start_epoch.saturating_sub(1));
        let state = TrainingState {
            epoch: last_epoch,
            best_metric: self.best_metric,
        };
        self.save_checkpoint(&model, &optim, &state, "latest")?;
        self.model = model;
        tracing::info!("学習が完了しました。学習時間: {:.2?}", training_start.elapsed());

        self.save_history(&history)?;
        Ok(TrainSummary {
            last_epoch,
            final_loss,
            best_metric: self.best_metric,
            history,
            learning_rates,
        })
    }

    fn save_history(&self, history: &[(String, Vec<f64>)]) -> Result<()> {
        let dir = &self.config.output_dir;
        let len = history.first().map(|(_, v)| v.len()).unwrap_or(0);
        if len == 0 {
            return Ok(());
        }
        let mut table = PointSet::new();
        table.insert("epoch", (1..=len).map(|e| e as f32).collect())?;
        for (name, values) in history {
            table.insert(name.clone(), values.iter().map(|&v| v as f32).collect())?;
        }
        save_csv_file(dir.join("loss_history.csv"), &table, ',')?;

        let png = dir.join("loss_history.png");
        match plot_loss_history(&png, history) {
            Ok(()) => tracing::info!("損失グラフを '{}' に保存しました", png.display()),
            Err(e) => tracing::warn!("損失グラフの描画に失敗しました: {e}"),
        }
        Ok(())
    }

    /// 全バリデータで評価します。
    pub fn eval(&self) -> Result<BTreeMap<String, ValidationReport>> {
        let model = self.eval_model();
        let mut reports = BTreeMap::new();
        for v in &self.validators {
            let start = Instant::now();
            let report = v.validate(&model, &self.device)?;
            for (metric, by_key) in &report.metrics {
                for (key, value) in by_key {
                    tracing::info!("[Eval] {}/{}.{}: {:.5e}", v.name(), key, metric, value);
                }
            }
            tracing::info!(
                "[Eval] {}/loss: {:.5e}, 所要時間 {:.2?}",
                v.name(),
                report.loss,
                start.elapsed()
            );
            reports.insert(v.name().to_string(), report);
        }
        Ok(reports)
    }

    /// 可視化器の出力を `<output_dir>/visual` に書き出します。
    pub fn visualize(&self) -> Result<()> {
        let model = self.eval_model();
        let dir = self.config.output_dir.join("visual");
        for (name, v) in &self.visualizers {
            let files = v.save(&dir, &model, &self.device)?;
            for f in files {
                tracing::info!("[Visualize] {}: {}", name, f.display());
            }
        }
        Ok(())
    }
}

/// `.../latest` に対する `.../latest_ema`。
fn ema_path(checkpoint: &Path) -> PathBuf {
    let mut name = OsString::from(checkpoint.as_os_str());
    name.push("_ema");
    PathBuf::from(name)
}

/// 最初のバリデータの最初の指標・最初のキーの値。
fn target_metric(
    validators: &[Validator],
    reports: &BTreeMap<String, ValidationReport>,
) -> Option<f64> {
    validators
        .first()
        .and_then(|v| reports.get(v.name()))
        .and_then(ValidationReport::target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmaConfig, LrSchedule, OptimizerConfig};
    use crate::constraint::DataloaderConfig;
    use crate::geometry::{Interval, Sampling};
    use crate::metric::Metric;
    use crate::model::MlpConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn model() -> Mlp<TestAutodiffBackend> {
        MlpConfig::new(vec!["x".into()], vec!["u".into()])
            .with_num_layers(1)
            .with_hidden_size(8)
            .init(&Default::default())
            .unwrap()
    }

    fn constraint(name: &str, output: Expr) -> Constraint {
        let geom = Interval::new(0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        Constraint::interior(name, &geom, DataloaderConfig::iterable(8, 1))
            .output("u", output)
            .label("u", Expr::c(0.0))
            .sampling(Sampling::evenly())
            .build(&mut rng)
            .unwrap()
    }

    fn temp_output(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("pinnkit_solver_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn config(output_dir: PathBuf, epochs: usize) -> SolverConfig {
        SolverConfig {
            output_dir,
            epochs,
            log_freq: 1,
            ..SolverConfig::default()
        }
    }

    /// 指標がモデルに依存しない（常に入力 `x` の二乗平均になる）バリデータ。
    fn constant_validator() -> Validator {
        let mut p = PointSet::new();
        p.insert("x", vec![0.5, 1.0]).unwrap();
        Validator::data("const", p)
            .output("x", Expr::var("x"))
            .label("x", Expr::c(0.0))
            .metric("MSE", Metric::Mse)
            .build()
            .unwrap()
    }

    fn solver(
        model: Mlp<TestAutodiffBackend>,
        config: SolverConfig,
    ) -> Solver<TestAutodiffBackend> {
        Solver::builder(model, config)
            .constraint(constraint("EQ", Expr::var("u")))
            .validator(constant_validator())
            .build(&Default::default())
            .unwrap()
    }

    fn sample_inputs() -> Tensor<NdArray<f32>, 2> {
        Tensor::from_data(TensorData::new(vec![0.1f32, 0.6], [2, 1]), &Default::default())
    }

    fn predict(model: &Mlp<TestAutodiffBackend>) -> Vec<f32> {
        model.valid().forward(sample_inputs()).into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn periodic_checkpoints_follow_save_freq() {
        let dir = temp_output("save_freq");
        let mut s = solver(model(), SolverConfig { save_freq: 2, ..config(dir.clone(), 5) });
        s.train().unwrap();
        let ckpt = dir.join("checkpoints");
        for epoch in [2, 4] {
            for file in [
                format!("epoch_{epoch}.mpk"),
                format!("epoch_{epoch}_optim.mpk"),
                format!("epoch_{epoch}_states.json"),
            ] {
                assert!(ckpt.join(&file).exists(), "{file} is missing");
            }
            let state = s.checkpoints().load_states(&format!("epoch_{epoch}")).unwrap();
            assert_eq!(state.epoch, epoch);
        }
        for epoch in [1, 3, 5] {
            assert!(!ckpt.join(format!("epoch_{epoch}.mpk")).exists());
        }
        assert!(ckpt.join("latest.mpk").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn no_periodic_checkpoints_when_save_freq_is_zero() {
        let dir = temp_output("no_save_freq");
        let mut s = solver(model(), config(dir.clone(), 2));
        s.train().unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with("epoch_")), "{names:?}");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn best_model_is_kept_when_metric_only_ties() {
        let dir = temp_output("best_tie");
        let cfg = SolverConfig {
            eval_during_train: true,
            eval_freq: 1,
            ..config(dir.clone(), 3)
        };
        let mut s = solver(model(), cfg);
        let summary = s.train().unwrap();

        // (0.5² + 1²) / 2
        assert_eq!(summary.best_metric, Some(0.625));
        let best = s.checkpoints().load_states("best_model").unwrap();
        assert_eq!(best.epoch, 1);
        assert_eq!(best.best_metric, Some(0.625));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scheduled_learning_rate_reaches_the_optimizer() {
        let initial = model();
        let dir_a = temp_output("lr_one_epoch");
        let mut one_epoch = solver(initial.clone(), config(dir_a.clone(), 1));
        one_epoch.train().unwrap();

        let dir_b = temp_output("lr_frozen");
        let frozen = SolverConfig {
            optimizer: OptimizerConfig {
                schedule: LrSchedule::Step {
                    step_size: 1,
                    gamma: 0.0,
                },
                ..OptimizerConfig::default()
            },
            ..config(dir_b.clone(), 3)
        };
        let mut three_epochs = solver(initial.clone(), frozen);
        let summary = three_epochs.train().unwrap();

        assert_eq!(summary.learning_rates, vec![1e-3, 0.0, 0.0]);
        // 2 エポック目以降は学習率 0 なので、1 エポックだけ学習したモデルと一致する
        assert_eq!(predict(three_epochs.model()), predict(one_epoch.model()));
        assert_ne!(predict(one_epoch.model()), predict(&initial));
        std::fs::remove_dir_all(&dir_a).ok();
        std::fs::remove_dir_all(&dir_b).ok();
    }

    #[test]
    fn ema_weights_are_saved_next_to_checkpoints() {
        let dir = temp_output("ema");
        let cfg = SolverConfig {
            ema: Some(EmaConfig { decay: 0.9 }),
            save_freq: 1,
            ..config(dir.clone(), 2)
        };
        let mut s = solver(model(), cfg);
        s.train().unwrap();
        assert_eq!(s.ema().map(|e| e.num_updates()), Some(2));
        for file in ["latest_ema.mpk", "epoch_1_ema.mpk", "epoch_2_ema.mpk"] {
            assert!(dir.join("checkpoints").join(file).exists(), "{file} is missing");
        }
        let averaged = s.eval_model().forward(sample_inputs()).into_data().to_vec::<f32>().unwrap();
        assert_ne!(predict(s.model()), averaged);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ema_path_appends_suffix() {
        assert_eq!(
            ema_path(Path::new("out/checkpoints/latest")),
            PathBuf::from("out/checkpoints/latest_ema")
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let r = Solver::builder(model(), SolverConfig::default())
            .constraint(constraint("EQ", Expr::var("u")))
            .constraint(constraint("EQ", Expr::var("u")))
            .build(&Default::default());
        assert!(matches!(r, Err(PinnError::Config(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let r = Solver::builder(model(), SolverConfig::default())
            .constraint(constraint("EQ", Expr::var("p")))
            .build(&Default::default());
        assert!(matches!(r, Err(PinnError::UnknownField(_))));
    }

    #[test]
    fn target_metric_uses_first_validator() {
        let mut p = PointSet::new();
        p.insert("x", vec![0.0, 1.0]).unwrap();
        let v1 = Validator::data("b", p.clone())
            .output("u", Expr::var("u"))
            .label("u", Expr::c(0.0))
            .metric("MSE", Metric::Mse)
            .build()
            .unwrap();
        let v2 = Validator::data("a", p)
            .output("u", Expr::var("u"))
            .label("u", Expr::c(0.0))
            .metric("MSE", Metric::Mse)
            .build()
            .unwrap();
        let report = |v: f64| ValidationReport {
            loss: v,
            metrics: BTreeMap::from([(
                "MSE".to_string(),
                BTreeMap::from([("u".to_string(), v)]),
            )]),
        };
        let reports =
            BTreeMap::from([("a".to_string(), report(1.0)), ("b".to_string(), report(2.0))]);
        assert_eq!(target_metric(&[v1, v2], &reports), Some(2.0));
    }
}
