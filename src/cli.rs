use crate::config::SolverConfig;
use crate::euler_beam;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Physics-informed neural network toolkit built on Burn (Euler beam example)",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train, eval, check）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 片持ち梁の問題を学習し、評価と可視化まで行います
    Train(RunArgs),
    /// 学習済みモデルを読み込み、評価と可視化を行います
    Eval(EvalArgs),
    /// 小さな問題を数エポック学習して、インストールを確認します
    Check(CheckArgs),
}

/// 設定ファイルの値を上書きするオプション。
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON 形式の設定ファイル
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct EvalArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// 読み込むモデル（既定: <output_dir>/checkpoints/best_model）
    #[arg(long)]
    pub pretrained_model_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[arg(long, default_value = "./output/check")]
    pub output_dir: PathBuf,
}

impl RunArgs {
    /// 既定値 ← 設定ファイル ← コマンドライン引数 の順に上書きした設定。
    pub fn resolve(&self) -> crate::Result<SolverConfig> {
        let mut config = match &self.config {
            Some(path) => SolverConfig::from_file(path)?,
            None => euler_beam::default_config(),
        };
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "pinnkit",
            "train",
            "--epochs",
            "5",
            "--output-dir",
            "out",
            "--seed",
            "7",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("train expected");
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.epochs, 5);
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.seed, 7);
        assert_eq!(config.eval_freq, 1000);
    }

    #[test]
    fn zero_epochs_are_rejected() {
        let args = RunArgs {
            epochs: Some(0),
            ..RunArgs::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn eval_accepts_model_path() {
        let cli = Cli::parse_from(["pinnkit", "eval", "--pretrained-model-path", "m/best_model"]);
        let Commands::Eval(args) = cli.command else {
            panic!("eval expected");
        };
        assert_eq!(args.pretrained_model_path, Some(PathBuf::from("m/best_model")));
    }

    #[test]
    fn check_has_default_output_dir() {
        let cli = Cli::parse_from(["pinnkit", "check"]);
        let Commands::Check(args) = cli.command else {
            panic!("check expected");
        };
        assert_eq!(args.output_dir, PathBuf::from("./output/check"));

        let cli = Cli::parse_from(["pinnkit", "check", "--output-dir", "tmp/check"]);
        let Commands::Check(args) = cli.command else {
            panic!("check expected");
        };
        assert_eq!(args.output_dir, PathBuf::from("tmp/check"));
    }
}
