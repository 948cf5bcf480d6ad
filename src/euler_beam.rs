//! 片持ち梁（オイラー・ベルヌーイ梁）のたわみ問題。
//!
//! 区間 `[0, 1]` で `u'''' = -1` を解きます。境界条件は
//! `u(0) = u'(0) = u''(1) = u'''(1) = 0` で、厳密解は
//! `u = -x⁴/24 + x³/6 - x²/4` です。

use crate::config::{OptimizerConfig, SolverConfig};
use crate::constraint::{Constraint, DataloaderConfig};
use crate::equation::{Biharmonic, Pde};
use crate::error::Result;
use crate::expr::Expr;
use crate::geometry::{Geometry, Interval, Sampling};
use crate::logger::init_logger;
use crate::loss::{Loss, Reduction};
use crate::metric::Metric;
use crate::misc::set_random_seed;
use crate::model::MlpConfig;
use crate::sampler::SamplerKind;
use crate::solver::{Solver, TrainSummary};
use crate::validate::{ValidationReport, Validator};
use crate::visualize::Visualizer;
use burn::tensor::backend::AutodiffBackend;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 内部点（残差）のバッチサイズ
const EQ_BATCH_SIZE: usize = 100;
/// 境界点のバッチサイズ（左端 2 点、右端 2 点）
const BC_BATCH_SIZE: usize = 4;
/// 評価・可視化に使う点数
const TOTAL_SIZE: usize = 100;

/// この問題の既定設定。
pub fn default_config() -> SolverConfig {
    SolverConfig {
        output_dir: PathBuf::from("./output/euler_beam"),
        epochs: 10000,
        iters_per_epoch: 1,
        eval_during_train: true,
        eval_freq: 1000,
        save_freq: 0,
        log_freq: 20,
        seed: 42,
        optimizer: OptimizerConfig {
            learning_rate: 1e-3,
            ..OptimizerConfig::default()
        },
        pretrained_model_path: None,
        checkpoint_path: None,
        ema: None,
    }
}

/// 厳密解 `u(x)`。
pub fn exact_solution() -> Expr {
    let x = || Expr::var("x");
    -x().powi(4) / 24.0 + x().powi(3) / 6.0 - x().powi(2) / 4.0
}

/// モデル・制約・バリデータ・可視化器を組み立ててソルバを作ります。
pub fn build_solver<B: AutodiffBackend>(
    config: SolverConfig,
    device: &B::Device,
) -> Result<Solver<B>> {
    let mut rng = set_random_seed::<B>(config.seed);

    let model = MlpConfig::new(vec!["x".to_string()], vec!["u".to_string()])
        .with_num_layers(3)
        .with_hidden_size(20)
        .init::<B>(device)?;

    let geom = Interval::new(0.0, 1.0)?;
    let equation = Biharmonic::new(1, -1.0, 1.0)?;

    let eq_loader = DataloaderConfig::iterable(EQ_BATCH_SIZE, 1);
    let pde_constraint = Constraint::interior("EQ", &geom, eq_loader)
        .outputs(equation.equations())
        .label("biharmonic", Expr::c(0.0))
        .loss(Loss::Mse(Reduction::Mean))
        .sampling(Sampling::random(SamplerKind::Hammersley))
        .build(&mut rng)?;

    let bc = Constraint::boundary("BC", &geom, DataloaderConfig::iterable(BC_BATCH_SIZE, 1))
        .output("u0", Expr::var("u").rows(0..1))
        .output("u__x", Expr::jacobian("u", "x").rows(1..2))
        .output("u__x__x", Expr::hessian("u", "x").rows(2..3))
        .output("u__x__x__x", Expr::hessian("u", "x").diff("x").rows(3..4))
        .label("u0", Expr::c(0.0))
        .label("u__x", Expr::c(0.0))
        .label("u__x__x", Expr::c(0.0))
        .label("u__x__x__x", Expr::c(0.0))
        .loss(Loss::Mse(Reduction::Sum))
        .sampling(Sampling::evenly())
        .build(&mut rng)?;

    let l2_rel_metric =
        Validator::geometry("L2Rel_Metric", &geom, TOTAL_SIZE, &Sampling::evenly(), &mut rng)?
            .output("u", Expr::var("u"))
            .label("u", exact_solution())
            .loss(Loss::Mse(Reduction::Mean))
            .metric("L2Rel", Metric::L2Rel)
            .build()?;

    let visu_points = geom.sample_interior(TOTAL_SIZE, &Sampling::evenly(), &mut rng)?;
    let visualizer = Visualizer::scatter_1d(
        visu_points,
        "x",
        BTreeMap::from([("u".to_string(), Expr::var("u"))]),
        1,
        "result_u",
    )?;

    Solver::builder(model, config)
        .constraint(pde_constraint)
        .constraint(bc)
        .validator(l2_rel_metric)
        .visualizer("visualize_u", visualizer)
        .equation(equation)
        .build(device)
}

/// 学習・評価・可視化を行い、ベストモデルを読み直してもう一度評価します。
pub fn run_train<B: AutodiffBackend>(
    config: SolverConfig,
    device: &B::Device,
) -> Result<TrainSummary> {
    let output_dir = config.output_dir.clone();
    init_logger(Some(output_dir.join("train.log").as_path()), "info")?;

    let mut solver = build_solver::<B>(config.clone(), device)?;
    let summary = solver.train()?;
    solver.eval()?;
    solver.visualize()?;

    init_logger(Some(output_dir.join("eval.log").as_path()), "info")?;
    let best = solver.checkpoints().model_path("best_model");
    if best.with_extension("mpk").exists() {
        let eval_config = SolverConfig {
            pretrained_model_path: Some(best),
            checkpoint_path: None,
            ..config
        };
        let solver = build_solver::<B>(eval_config, device)?;
        solver.eval()?;
        solver.visualize()?;
    } else {
        tracing::warn!("ベストモデルが保存されていないため、再評価を省略します");
    }
    Ok(summary)
}

/// 学習済みモデルを読み込んで評価・可視化します。
///
/// `pretrained_model_path` が未指定なら `<output_dir>/checkpoints/best_model` を使います。
pub fn run_eval<B: AutodiffBackend>(
    mut config: SolverConfig,
    device: &B::Device,
) -> Result<BTreeMap<String, ValidationReport>> {
    init_logger(Some(config.output_dir.join("eval.log").as_path()), "info")?;
    if config.pretrained_model_path.is_none() {
        let best = config.output_dir.join("checkpoints").join("best_model");
        config.pretrained_model_path = Some(best);
    }
    let solver = build_solver::<B>(config, device)?;
    let reports = solver.eval()?;
    solver.visualize()?;
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PointSet;

    #[test]
    fn exact_solution_satisfies_clamped_end() {
        let mut p = PointSet::new();
        p.insert("x", vec![0.0, 1.0]).unwrap();
        let u = exact_solution().eval_points(&p).unwrap();
        assert_eq!(u[0], 0.0);
        assert!((u[1] - (-1.0 / 24.0 + 1.0 / 6.0 - 0.25) as f32).abs() < 1e-7);

        // u'''' = -1
        let d4 = exact_solution().diff("x").diff("x").diff("x").diff("x");
        let v = d4.eval_points(&p).unwrap();
        assert!(v.iter().all(|&d| (d + 1.0).abs() < 1e-6));
    }

    #[test]
    fn default_config_is_valid() {
        let config = default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer.learning_rate, 1e-3);
        assert_eq!(config.eval_freq, 1000);
    }
}
