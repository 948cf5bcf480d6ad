//! # 物理情報ニューラルネットワーク (PINN) ツールキット
//!
//! `burn` フレームワークの上に、PINN で順問題を解くための部品を提供します。
//!
//! - 幾何領域と点の標本化（[`geometry`], [`sampler`]）
//! - 偏微分方程式の残差式（[`expr`], [`equation`]）と、その高階微分の評価（[`jet`]）
//! - 損失の各項となる制約（[`constraint`]）、評価（[`validate`]）、可視化（[`visualize`]）
//! - 学習ループとチェックポイント（[`solver`], [`checkpoint`]）、重みの移動平均（[`ema`]）
//! - CSV・NPZ・MAT・VTK の読み込みと Tecplot への書き出し（[`data`]）
//!
//! 例題として片持ち梁のたわみ問題（[`euler_beam`]）を含みます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --epochs 10000
//! ```
//!
//! ### 評価
//! ```bash
//! cargo run --release -- eval --output-dir ./output/euler_beam
//! ```
//!
//! ### 動作確認
//! ```bash
//! cargo run --release -- check
//! ```

pub mod check;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod constraint;
pub mod data;
pub mod ema;
pub mod equation;
pub mod error;
pub mod euler_beam;
pub mod expr;
pub mod geometry;
pub mod jet;
pub mod logger;
pub mod loss;
pub mod metric;
pub mod misc;
pub mod model;
pub mod sampler;
pub mod solver;
pub mod validate;
pub mod visualize;

pub use error::{PinnError, Result};
