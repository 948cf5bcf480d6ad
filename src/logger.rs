//! `tracing` によるログ出力の初期化。
//!
//! 標準出力とログファイルの両方に書き出します。サブスクライバはプロセスで一度だけ
//! 登録し、2回目以降の [`init_logger`] 呼び出しは書き込み先のファイルだけを切り替えます
//! （学習時の `train.log` から評価時の `eval.log` へ、など）。

use crate::error::Result;
use once_cell::sync::Lazy;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static LOG_FILE: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(None));
static SUBSCRIBER: Lazy<()> = Lazy::new(install_subscriber);
static LEVEL: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new("info".to_string()));

/// 現在のログファイルへ書き込む `io::Write` 実装。ファイル未設定時は破棄します。
struct FileSink;

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match LOG_FILE.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match LOG_FILE.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

fn install_subscriber() {
    let level = LEVEL
        .lock()
        .map(|l| l.clone())
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(|| FileSink);
    // テストなどで既に別のサブスクライバが登録されている場合はそちらを優先する
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}

/// ロガーを初期化し、`log_file` が指定されていればそのファイルへ追記します。
///
/// `level` は `RUST_LOG` が未設定の場合のみ、最初の呼び出し時に使われます。
pub fn init_logger(log_file: Option<&Path>, level: &str) -> Result<()> {
    if let Ok(mut l) = LEVEL.lock() {
        *l = level.to_string();
    }
    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        }
        None => None,
    };
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = file;
    }
    Lazy::force(&SUBSCRIBER);
    if let Some(path) = log_file {
        tracing::info!("ログ出力先: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_created_and_switched() {
        let dir = std::env::temp_dir().join(format!("pinnkit_logger_{}", std::process::id()));
        let train = dir.join("train.log");
        let eval = dir.join("eval.log");

        init_logger(Some(train.as_path()), "info").unwrap();
        init_logger(Some(eval.as_path()), "info").unwrap();

        assert!(train.exists());
        assert!(eval.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
