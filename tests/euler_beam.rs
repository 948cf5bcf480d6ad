use burn::backend::{Autodiff, NdArray};
use pinnkit::config::SolverConfig;
use pinnkit::euler_beam;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

type TestBackend = Autodiff<NdArray<f32>>;

/// `run_train`/`run_eval` はプロセス共通のログ出力先を切り替えるので、1つずつ実行する。
static LOG_SINK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    LOG_SINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn temp_output(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pinnkit_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn short_config(output_dir: PathBuf, epochs: usize) -> SolverConfig {
    SolverConfig {
        output_dir,
        epochs,
        eval_freq: 10,
        log_freq: 1,
        ..euler_beam::default_config()
    }
}

#[test]
fn short_training_run_reduces_loss_and_writes_outputs() {
    let _guard = serial();
    let dir = temp_output("train");
    let device = Default::default();
    let summary =
        euler_beam::run_train::<TestBackend>(short_config(dir.clone(), 30), &device).unwrap();

    assert_eq!(summary.last_epoch, 30);
    let (name, total) = &summary.history[0];
    assert_eq!(name, "loss");
    assert_eq!(total.len(), 30);
    assert!(total.iter().all(|v| v.is_finite()));
    assert!(total[29] < total[0], "loss did not decrease: {} -> {}", total[0], total[29]);
    assert_eq!(
        summary.history.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
        vec!["loss", "EQ", "BC"]
    );
    assert!(summary.best_metric.is_some());

    for file in [
        "train.log",
        "eval.log",
        "loss_history.csv",
        "checkpoints/latest.mpk",
        "checkpoints/latest_optim.mpk",
        "checkpoints/latest_states.json",
        "checkpoints/best_model.mpk",
        "visual/result_u.csv",
    ] {
        assert!(dir.join(file).exists(), "{file} is missing");
    }

    let csv = std::fs::read_to_string(dir.join("loss_history.csv")).unwrap();
    assert_eq!(csv.lines().next(), Some("BC,EQ,epoch,loss"));
    assert_eq!(csv.lines().count(), 31);

    let train_log = std::fs::read_to_string(dir.join("train.log")).unwrap();
    assert!(train_log.contains("[Train][Epoch 30/30]"));
    let eval_log = std::fs::read_to_string(dir.join("eval.log")).unwrap();
    assert!(eval_log.contains("[Eval] L2Rel_Metric/u.L2Rel"));
    assert!(!eval_log.contains("[Train]"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn training_resumes_from_latest_checkpoint() {
    let _guard = serial();
    let dir = temp_output("resume");
    let device = Default::default();
    euler_beam::run_train::<TestBackend>(short_config(dir.clone(), 10), &device).unwrap();

    let config = SolverConfig {
        checkpoint_path: Some(dir.join("checkpoints").join("latest")),
        ..short_config(dir.clone(), 15)
    };
    let mut solver = euler_beam::build_solver::<TestBackend>(config, &device).unwrap();
    let summary = solver.train().unwrap();
    assert_eq!(summary.last_epoch, 15);
    assert_eq!(summary.history[0].1.len(), 5);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn eval_without_pretrained_model_reports_missing_checkpoint() {
    let _guard = serial();
    let dir = temp_output("eval_missing");
    let device = Default::default();
    let err =
        euler_beam::run_eval::<TestBackend>(short_config(dir.clone(), 1), &device).unwrap_err();
    assert!(matches!(err, pinnkit::PinnError::Checkpoint(_)));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn eval_reloads_best_model() {
    let _guard = serial();
    let dir = temp_output("eval");
    let device = Default::default();
    euler_beam::run_train::<TestBackend>(short_config(dir.clone(), 10), &device).unwrap();

    let reports =
        euler_beam::run_eval::<TestBackend>(short_config(dir.clone(), 1), &device).unwrap();
    let l2 = reports["L2Rel_Metric"].metrics["L2Rel"]["u"];
    assert!(l2.is_finite());
    std::fs::remove_dir_all(&dir).ok();
}
