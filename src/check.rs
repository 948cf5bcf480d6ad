//! インストール直後の動作確認。
//!
//! 単位正方形上のラプラス方程式を数エポックだけ学習し、学習・評価・保存が
//! 一通り動くことを確かめます。

use crate::config::SolverConfig;
use crate::constraint::{Constraint, DataloaderConfig};
use crate::equation::{Laplace, Pde};
use crate::error::{PinnError, Result};
use crate::expr::Expr;
use crate::geometry::{Rectangle, Sampling};
use crate::metric::Metric;
use crate::misc::set_random_seed;
use crate::model::MlpConfig;
use crate::sampler::SamplerKind;
use crate::solver::{Solver, TrainSummary};
use crate::validate::Validator;
use burn::tensor::backend::AutodiffBackend;
use std::path::Path;

const CHECK_EPOCHS: usize = 5;
const CHECK_SEED: u64 = 42;

/// 境界で `u = x` を課したラプラス方程式を解きます。厳密解は `u = x` です。
///
/// 損失と評価値がすべて有限であれば成功です。結果は `output_dir` に書き出します。
pub fn run_check<B: AutodiffBackend>(
    output_dir: &Path,
    device: &B::Device,
) -> Result<TrainSummary> {
    let mut rng = set_random_seed::<B>(CHECK_SEED);
    let model = MlpConfig::new(vec!["x".into(), "y".into()], vec!["u".into()])
        .with_num_layers(2)
        .with_hidden_size(16)
        .init::<B>(device)?;

    let geom = Rectangle::new([0.0, 0.0], [1.0, 1.0])?;
    let equation = Laplace::new(2)?;
    let interior = Constraint::interior("EQ", &geom, DataloaderConfig::iterable(64, 1))
        .outputs(equation.equations())
        .label("laplace", Expr::c(0.0))
        .sampling(Sampling::random(SamplerKind::Pseudo))
        .build(&mut rng)?;
    let boundary = Constraint::boundary("BC", &geom, DataloaderConfig::iterable(32, 1))
        .output("u", Expr::var("u"))
        .label("u", Expr::var("x"))
        .sampling(Sampling::random(SamplerKind::Pseudo))
        .build(&mut rng)?;
    let validator = Validator::geometry("L2Rel_Metric", &geom, 64, &Sampling::evenly(), &mut rng)?
        .output("u", Expr::var("u"))
        .label("u", Expr::var("x"))
        .metric("L2Rel", Metric::L2Rel)
        .build()?;

    let config = SolverConfig {
        output_dir: output_dir.to_path_buf(),
        epochs: CHECK_EPOCHS,
        eval_during_train: true,
        eval_freq: CHECK_EPOCHS,
        log_freq: 1,
        seed: CHECK_SEED,
        ..SolverConfig::default()
    };
    let mut solver = Solver::builder(model, config)
        .constraint(interior)
        .constraint(boundary)
        .validator(validator)
        .equation(equation)
        .build(device)?;
    let summary = solver.train()?;

    if let Some((name, values)) = summary
        .history
        .iter()
        .find(|(_, values)| values.iter().any(|v| !v.is_finite()))
    {
        return Err(PinnError::Check(format!(
            "損失 '{name}' に有限でない値があります: {values:?}"
        )));
    }
    match summary.best_metric {
        Some(m) if m.is_finite() => {}
        other => {
            return Err(PinnError::Check(format!(
                "評価値が得られませんでした: {other:?}"
            )));
        }
    }
    tracing::info!(
        "動作確認に成功しました（{} エポック, 最終損失 {:.5e}）",
        summary.last_epoch,
        summary.final_loss
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn check_run_trains_and_saves() {
        let dir = std::env::temp_dir().join(format!("pinnkit_check_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let summary = run_check::<TestAutodiffBackend>(&dir, &Default::default()).unwrap();

        assert_eq!(summary.last_epoch, CHECK_EPOCHS);
        assert_eq!(summary.history[0].1.len(), CHECK_EPOCHS);
        assert!(summary.best_metric.is_some_and(f64::is_finite));
        assert!(dir.join("checkpoints/latest.mpk").exists());
        assert!(dir.join("checkpoints/best_model.mpk").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
