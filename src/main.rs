use anyhow::Result;
use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use pinnkit::check::run_check;
use pinnkit::cli::{Cli, Commands};
use pinnkit::euler_beam;
use pinnkit::logger::init_logger;

type MyBackend = Autodiff<NdArray<f32>>;

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、`train`・`eval`・`check`の処理に振り分けます。
fn main() -> Result<()> {
    let cli = Cli::parse();
    let device = Default::default();

    match &cli.command {
        Commands::Train(args) => {
            let config = args.resolve()?;
            let summary = euler_beam::run_train::<MyBackend>(config, &device)?;
            tracing::info!(
                "最終損失: {:.5e}, ベスト指標: {:?}",
                summary.final_loss,
                summary.best_metric
            );
        }
        Commands::Eval(args) => {
            let mut config = args.run.resolve()?;
            if let Some(path) = &args.pretrained_model_path {
                config.pretrained_model_path = Some(path.clone());
            }
            euler_beam::run_eval::<MyBackend>(config, &device)?;
        }
        Commands::Check(args) => {
            init_logger(Some(args.output_dir.join("check.log").as_path()), "info")?;
            run_check::<MyBackend>(&args.output_dir, &device)?;
        }
    }
    Ok(())
}
