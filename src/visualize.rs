//! 予測結果と損失履歴の可視化。

use crate::data::{PointSet, save_csv_file};
use crate::error::{PinnError, Result};
use crate::expr::Expr;
use crate::model::Mlp;
use crate::validate::predict_batched;
use burn::prelude::Backend;
use plotters::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Scatter1d { coord_key: String, num_timestamps: usize },
    Csv,
}

/// 点群上でモデル出力を評価し、画像や CSV に書き出す可視化器。
#[derive(Debug, Clone)]
pub struct Visualizer {
    kind: Kind,
    points: PointSet,
    outputs: BTreeMap<String, Expr>,
    prefix: String,
    batch_size: usize,
}

impl Visualizer {
    /// 1次元座標 `coord_key` を横軸にした散布図。
    ///
    /// `num_timestamps > 1` のときは点群を同じ大きさのブロックに分け、
    /// ブロックごとに `<prefix>_<t>.png` を出力します。
    pub fn scatter_1d(
        points: PointSet,
        coord_key: impl Into<String>,
        outputs: BTreeMap<String, Expr>,
        num_timestamps: usize,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        let coord_key = coord_key.into();
        points.get(&coord_key)?;
        if num_timestamps == 0 || points.len() % num_timestamps != 0 {
            return Err(PinnError::Config(format!(
                "点数 {} を時刻数 {} で等分できません",
                points.len(),
                num_timestamps
            )));
        }
        Self::new(
            Kind::Scatter1d {
                coord_key,
                num_timestamps,
            },
            points,
            outputs,
            prefix.into(),
        )
    }

    /// 入力座標と出力を CSV だけに書き出す可視化器。
    pub fn csv(
        points: PointSet,
        outputs: BTreeMap<String, Expr>,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        Self::new(Kind::Csv, points, outputs, prefix.into())
    }

    fn new(
        kind: Kind,
        points: PointSet,
        outputs: BTreeMap<String, Expr>,
        prefix: String,
    ) -> Result<Self> {
        if outputs.is_empty() {
            return Err(PinnError::Config(format!(
                "可視化器 '{prefix}' に出力式がありません"
            )));
        }
        if points.is_empty() {
            return Err(PinnError::Config(format!(
                "可視化器 '{prefix}' の点群が空です"
            )));
        }
        // 出力 CSV では入力列と出力列を同じ表に並べる
        if let Some(key) = outputs.keys().find(|k| points.contains(k)) {
            return Err(PinnError::Config(format!(
                "可視化器 '{prefix}' の出力 '{key}' が点群の列名と重なります"
            )));
        }
        let batch_size = points.len();
        Ok(Self {
            kind,
            points,
            outputs,
            prefix,
            batch_size,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn points(&self) -> &PointSet {
        &self.points
    }

    pub fn output_expr(&self) -> &BTreeMap<String, Expr> {
        &self.outputs
    }

    /// `dir` 以下にファイルを書き出し、作成したパスを返します。
    pub fn save<B: Backend>(
        &self,
        dir: &Path,
        model: &Mlp<B>,
        device: &B::Device,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let preds = predict_batched(model, &self.points, &self.outputs, self.batch_size, device)?;

        let mut table = PointSet::new();
        for key in model.input_keys() {
            table.insert(key.clone(), self.points.get(key)?.to_vec())?;
        }
        for (key, values) in &preds {
            table.insert(key.clone(), values.clone())?;
        }
        let csv_path = dir.join(format!("{}.csv", self.prefix));
        save_csv_file(&csv_path, &table, ',')?;
        let mut written = vec![csv_path];

        if let Kind::Scatter1d { coord_key, .. } = &self.kind {
            for (path, series) in self.timestamp_series(dir, &preds)? {
                // 描画の失敗（フォントが無い環境など）は CSV の出力を妨げない
                match plot_scatter(&path, coord_key, &series) {
                    Ok(()) => written.push(path),
                    Err(e) => tracing::warn!("'{}' の描画に失敗しました: {}", path.display(), e),
                }
            }
        }
        Ok(written)
    }

    /// 散布図ごとの出力先と、出力キーごとの `(座標, 予測値)` 列。
    ///
    /// 点群を `num_timestamps` 個の連続したブロックに分け、t 番目のブロックを
    /// `<prefix>_<t>.png` に割り当てます。時刻が1つなら `<prefix>.png` だけです。
    fn timestamp_series(
        &self,
        dir: &Path,
        preds: &BTreeMap<String, Vec<f32>>,
    ) -> Result<Vec<(PathBuf, Vec<(String, Vec<(f64, f64)>)>)>> {
        let Kind::Scatter1d {
            coord_key,
            num_timestamps,
        } = &self.kind
        else {
            return Ok(Vec::new());
        };
        let coord = self.points.get(coord_key)?;
        let block = coord.len() / num_timestamps;
        let mut plots = Vec::with_capacity(*num_timestamps);
        for t in 0..*num_timestamps {
            let path = if *num_timestamps == 1 {
                dir.join(format!("{}.png", self.prefix))
            } else {
                dir.join(format!("{}_{}.png", self.prefix, t))
            };
            let rows = t * block..(t + 1) * block;
            let series = preds
                .iter()
                .map(|(key, values)| {
                    let pts = coord[rows.clone()]
                        .iter()
                        .zip(&values[rows.clone()])
                        .map(|(&x, &y)| (x as f64, y as f64))
                        .collect();
                    (key.clone(), pts)
                })
                .collect();
            plots.push((path, series));
        }
        Ok(plots)
    }
}

fn plot_err<E: std::fmt::Display>(e: E) -> PinnError {
    PinnError::Plot(e.to_string())
}

/// 有限値の最小・最大。幅 0 の範囲は少し広げます。
fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    (lo - pad, hi + pad)
}

fn plot_scatter(
    path: &Path,
    coord_key: &str,
    series: &[(String, Vec<(f64, f64)>)],
) -> Result<()> {
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let (x_min, x_max) = value_range(series.iter().flat_map(|(_, p)| p.iter().map(|q| q.0)));
    let (y_min, y_max) = value_range(series.iter().flat_map(|(_, p)| p.iter().map(|q| q.1)));
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc(coord_key)
        .draw()
        .map_err(plot_err)?;
    for (i, (key, pts)) in series.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(pts.iter().map(|&p| Circle::new(p, 3, color.filled())))
            .map_err(plot_err)?
            .label(key.as_str())
            .legend(move |(x, y)| Circle::new((x + 10, y), 3, color.filled()));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

/// 学習過程の損失をグラフとして PNG ファイルに出力します。
///
/// `history` の各系列を常用対数で描画します。先頭の系列（全体の損失）は赤で描きます。
pub fn plot_loss_history(path: &Path, history: &[(String, Vec<f64>)]) -> Result<()> {
    let len = history.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    if len == 0 {
        return Ok(());
    }
    let log = |v: f64| v.max(1e-30).log10();
    let (min_log_loss, max_log_loss) =
        value_range(history.iter().flat_map(|(_, v)| v.iter().map(|&x| log(x))));

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..len, min_log_loss..max_log_loss)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epochs")
        .draw()
        .map_err(plot_err)?;
    for (i, (name, values)) in history.iter().enumerate() {
        let color = if i == 0 { RED.to_rgba() } else { Palette99::pick(i).to_rgba() };
        chart
            .draw_series(LineSeries::new(
                values.iter().enumerate().map(|(e, &v)| (e, log(v))),
                color,
            ))
            .map_err(plot_err)?
            .label(name.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}
