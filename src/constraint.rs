//! 損失の1項を構成する制約条件。
//!
//! 制約は「何を評価するか（出力式）」「どこで評価するか（点群）」「何に近づけるか（ラベル）」
//! 「どう測るか（損失関数）」をひとまとめにしたものです。

use crate::data::PointSet;
use crate::error::{PinnError, Result};
use crate::expr::Expr;
use crate::geometry::{Geometry, Sampling};
use crate::jet::Evaluation;
use crate::loss::Loss;
use crate::model::Mlp;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use rand::RngCore;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 1エポック内でのデータの供給方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DatasetKind {
    /// 毎イテレーション全点を使う
    #[default]
    Iterable,
    /// `batch_size` ごとに区切って順に使う
    Batched { shuffle: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataloaderConfig {
    pub batch_size: usize,
    pub iters_per_epoch: usize,
    pub dataset: DatasetKind,
}

impl DataloaderConfig {
    pub fn iterable(batch_size: usize, iters_per_epoch: usize) -> Self {
        Self {
            batch_size,
            iters_per_epoch,
            dataset: DatasetKind::Iterable,
        }
    }

    pub fn batched(batch_size: usize, iters_per_epoch: usize, shuffle: bool) -> Self {
        Self {
            batch_size,
            iters_per_epoch,
            dataset: DatasetKind::Batched { shuffle },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Interior,
    Boundary,
    Supervised,
}

enum Source<'g> {
    Geometry(&'g dyn Geometry),
    Data(PointSet),
}

/// [`Constraint`] の組み立て。
pub struct ConstraintBuilder<'g> {
    name: String,
    kind: ConstraintKind,
    source: Source<'g>,
    cfg: DataloaderConfig,
    outputs: BTreeMap<String, Expr>,
    labels: BTreeMap<String, Expr>,
    weights: BTreeMap<String, f32>,
    loss: Loss,
    sampling: Sampling,
}

impl<'g> ConstraintBuilder<'g> {
    pub fn output(mut self, key: impl Into<String>, expr: Expr) -> Self {
        self.outputs.insert(key.into(), expr);
        self
    }

    pub fn outputs(mut self, map: BTreeMap<String, Expr>) -> Self {
        self.outputs.extend(map);
        self
    }

    pub fn label(mut self, key: impl Into<String>, expr: Expr) -> Self {
        self.labels.insert(key.into(), expr);
        self
    }

    pub fn labels(mut self, map: BTreeMap<String, Expr>) -> Self {
        self.labels.extend(map);
        self
    }

    pub fn weight(mut self, key: impl Into<String>, weight: f32) -> Self {
        self.weights.insert(key.into(), weight);
        self
    }

    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// 点を標本化し、ラベルを計算して制約を作ります。
    pub fn build(self, rng: &mut dyn RngCore) -> Result<Constraint> {
        if self.cfg.batch_size == 0 || self.cfg.iters_per_epoch == 0 {
            return Err(PinnError::Config(format!(
                "制約 '{}': batch_size と iters_per_epoch は正である必要があります",
                self.name
            )));
        }
        if self.outputs.is_empty() {
            return Err(PinnError::Config(format!(
                "制約 '{}' に出力式がありません",
                self.name
            )));
        }
        let out_keys: BTreeSet<&String> = self.outputs.keys().collect();
        let label_keys: BTreeSet<&String> = self.labels.keys().collect();
        if out_keys != label_keys {
            return Err(PinnError::Config(format!(
                "制約 '{}': 出力 {:?} とラベル {:?} のキーが一致しません",
                self.name, out_keys, label_keys
            )));
        }
        if let Some(key) = self.weights.keys().find(|k| !self.outputs.contains_key(*k)) {
            return Err(PinnError::Config(format!(
                "制約 '{}': 重み '{}' に対応する出力がありません",
                self.name, key
            )));
        }

        let n = self.cfg.batch_size * self.cfg.iters_per_epoch;
        let points = match self.source {
            Source::Geometry(geom) => match self.kind {
                ConstraintKind::Boundary => geom.sample_boundary(n, &self.sampling, rng)?,
                _ => geom.sample_interior(n, &self.sampling, rng)?,
            },
            Source::Data(points) => points,
        };
        if points.is_empty() {
            return Err(PinnError::Config(format!(
                "制約 '{}' の点群が空です",
                self.name
            )));
        }

        let mut labels = PointSet::new();
        for (key, expr) in &self.labels {
            labels.insert(key.clone(), expr.eval_points(&points)?)?;
        }

        tracing::debug!(
            "制約 '{}' を作成しました: {} 点, 出力 {:?}",
            self.name,
            points.len(),
            out_keys
        );
        let order = (0..points.len()).collect();
        Ok(Constraint {
            name: self.name,
            kind: self.kind,
            points,
            output_expr: self.outputs,
            labels,
            weights: self.weights,
            loss: self.loss,
            cfg: self.cfg,
            order,
        })
    }
}

/// 総損失に寄与する名前付きの1項。
#[derive(Debug, Clone)]
pub struct Constraint {
    name: String,
    kind: ConstraintKind,
    points: PointSet,
    output_expr: BTreeMap<String, Expr>,
    labels: PointSet,
    weights: BTreeMap<String, f32>,
    loss: Loss,
    cfg: DataloaderConfig,
    order: Vec<usize>,
}

impl Constraint {
    fn builder<'g>(
        name: impl Into<String>,
        kind: ConstraintKind,
        source: Source<'g>,
        cfg: DataloaderConfig,
    ) -> ConstraintBuilder<'g> {
        ConstraintBuilder {
            name: name.into(),
            kind,
            source,
            cfg,
            outputs: BTreeMap::new(),
            labels: BTreeMap::new(),
            weights: BTreeMap::new(),
            loss: Loss::default(),
            sampling: Sampling::default(),
        }
    }

    /// 領域内部の点で評価する制約（PDE 残差など）。
    pub fn interior<'g>(
        name: impl Into<String>,
        geom: &'g dyn Geometry,
        cfg: DataloaderConfig,
    ) -> ConstraintBuilder<'g> {
        Self::builder(name, ConstraintKind::Interior, Source::Geometry(geom), cfg)
    }

    /// 境界上の点で評価する制約。
    pub fn boundary<'g>(
        name: impl Into<String>,
        geom: &'g dyn Geometry,
        cfg: DataloaderConfig,
    ) -> ConstraintBuilder<'g> {
        Self::builder(name, ConstraintKind::Boundary, Source::Geometry(geom), cfg)
    }

    /// 与えられたデータ点で評価する制約（観測値への当てはめ）。
    pub fn supervised(
        name: impl Into<String>,
        points: PointSet,
        cfg: DataloaderConfig,
    ) -> ConstraintBuilder<'static> {
        Self::builder(name, ConstraintKind::Supervised, Source::Data(points), cfg)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    pub fn points(&self) -> &PointSet {
        &self.points
    }

    pub fn labels(&self) -> &PointSet {
        &self.labels
    }

    pub fn output_expr(&self) -> &BTreeMap<String, Expr> {
        &self.output_expr
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// エポック開始時の並べ替え（シャッフル指定の Batched のみ）。
    pub fn shuffle(&mut self, rng: &mut dyn RngCore) {
        if let DatasetKind::Batched { shuffle: true } = self.cfg.dataset {
            self.order.shuffle(rng);
        }
    }

    /// `iter` 番目のイテレーションで使う行番号。
    pub fn batch_indices(&self, iter: usize) -> Vec<usize> {
        match self.cfg.dataset {
            DatasetKind::Iterable => (0..self.len()).collect(),
            DatasetKind::Batched { .. } => {
                let bs = self.cfg.batch_size;
                let num_batches = self.len().div_ceil(bs);
                let b = iter % num_batches;
                let end = ((b + 1) * bs).min(self.len());
                self.order[b * bs..end].to_vec()
            }
        }
    }

    /// `iter` 番目のイテレーションの入力点とラベル。
    pub fn batch(&self, iter: usize) -> Result<(PointSet, PointSet)> {
        let idx = self.batch_indices(iter);
        Ok((self.points.select(&idx)?, self.labels.select(&idx)?))
    }

    /// `iter` 番目のバッチでの損失。
    pub fn compute_loss<B: Backend>(
        &self,
        model: &Mlp<B>,
        iter: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 1>> {
        let (points, labels) = self.batch(iter)?;
        let eval = Evaluation::new(model, &points, device)?;
        let mut outputs = BTreeMap::new();
        let mut targets = BTreeMap::new();
        for (key, expr) in &self.output_expr {
            let out = eval.evaluate(expr)?;
            let mut label = labels.column_tensor::<B>(key, device)?;
            // 行スライスした出力にはラベルも同じ行を対応させる
            if let Some(rows) = expr.row_range() {
                if rows.end > labels.len() {
                    return Err(PinnError::Shape(format!(
                        "制約 '{}': 行 {:?} がバッチサイズ {} の外にあります",
                        self.name,
                        rows,
                        labels.len()
                    )));
                }
                label = label.slice([rows, 0..1]);
            }
            outputs.insert(key.clone(), out);
            targets.insert(key.clone(), label);
        }
        self.loss.compute(&outputs, &targets, &self.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Interval;
    use crate::loss::Reduction;
    use crate::model::MlpConfig;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    type TestBackend = NdArray<f32>;

    fn model() -> Mlp<TestBackend> {
        MlpConfig::new(vec!["x".into()], vec!["u".into()])
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn interior_constraint_samples_batch_times_iters() {
        let geom = Interval::new(0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let c = Constraint::interior("EQ", &geom, DataloaderConfig::iterable(10, 3))
            .output("r", Expr::hessian("u", "x"))
            .label("r", Expr::c(0.0))
            .build(&mut rng)
            .unwrap();
        assert_eq!(c.len(), 30);
        assert_eq!(c.batch_indices(2).len(), 30);
        assert_eq!(c.labels().get("r").unwrap(), &[0.0; 30][..]);
    }

    #[test]
    fn mismatched_keys_are_rejected() {
        let geom = Interval::new(0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let r = Constraint::interior("EQ", &geom, DataloaderConfig::iterable(4, 1))
            .output("r", Expr::var("u"))
            .label("s", Expr::c(0.0))
            .build(&mut rng);
        assert!(matches!(r, Err(PinnError::Config(_))));

        let r = Constraint::interior("EQ", &geom, DataloaderConfig::iterable(4, 1))
            .output("r", Expr::var("u"))
            .label("r", Expr::c(0.0))
            .weight("q", 2.0)
            .build(&mut rng);
        assert!(matches!(r, Err(PinnError::Config(_))));
    }

    #[test]
    fn batched_supervised_data_cycles_through_batches() {
        let mut points = PointSet::new();
        points.insert("x", vec![0.0, 0.1, 0.2, 0.3, 0.4]).unwrap();
        points.insert("u_obs", vec![1.0; 5]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut c = Constraint::supervised("data", points, DataloaderConfig::batched(2, 3, true))
            .output("u", Expr::var("u"))
            .label("u", Expr::var("u_obs"))
            .build(&mut rng)
            .unwrap();
        assert_eq!(c.batch_indices(0), vec![0, 1]);
        assert_eq!(c.batch_indices(2), vec![4]);
        assert_eq!(c.batch_indices(3), vec![0, 1]);

        c.shuffle(&mut rng);
        let mut all: Vec<usize> = (0..3).flat_map(|i| c.batch_indices(i)).collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn boundary_rows_align_labels() {
        let geom = Interval::new(0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let c = Constraint::boundary("BC", &geom, DataloaderConfig::iterable(4, 1))
            .output("u0", Expr::var("u").rows(0..1))
            .output("u__x", Expr::jacobian("u", "x").rows(1..2))
            .label("u0", Expr::c(0.0))
            .label("u__x", Expr::c(0.0))
            .loss(Loss::Mse(Reduction::Sum))
            .sampling(Sampling::evenly())
            .build(&mut rng)
            .unwrap();
        assert_eq!(c.points().get("x").unwrap(), &[0.0, 0.0, 1.0, 1.0]);

        let device = Default::default();
        let m = model();
        let loss = c.compute_loss(&m, 0, &device).unwrap();
        let value = loss.into_scalar().elem::<f32>();

        let eval = Evaluation::new(&m, c.points(), &device).unwrap();
        let u0 = eval.output("u").unwrap().into_data().to_vec::<f32>().unwrap()[0];
        let ux = eval
            .derivative("u", &["x".to_string()])
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap()[1];
        assert!((value - (u0 * u0 + ux * ux)).abs() < 1e-5);
    }
}
