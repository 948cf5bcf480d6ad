//! 学習中・学習後のモデル評価。

use crate::data::PointSet;
use crate::error::{PinnError, Result};
use crate::expr::Expr;
use crate::geometry::{Geometry, Sampling};
use crate::jet::Evaluation;
use crate::loss::Loss;
use crate::metric::Metric;
use crate::model::Mlp;
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};

/// 1つのバリデータによる評価結果。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub loss: f64,
    /// 指標名 → 出力キー → 値
    pub metrics: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ValidationReport {
    /// 最初の指標の最初のキーの値（ベストモデル判定に使う）。
    pub fn target(&self) -> Option<f64> {
        self.metrics
            .values()
            .next()
            .and_then(|by_key| by_key.values().next().copied())
    }
}

/// [`Validator`] の組み立て。
pub struct ValidatorBuilder {
    name: String,
    points: PointSet,
    outputs: BTreeMap<String, Expr>,
    labels: BTreeMap<String, Expr>,
    loss: Loss,
    metrics: BTreeMap<String, Metric>,
    batch_size: Option<usize>,
}

impl ValidatorBuilder {
    pub fn output(mut self, key: impl Into<String>, expr: Expr) -> Self {
        self.outputs.insert(key.into(), expr);
        self
    }

    pub fn label(mut self, key: impl Into<String>, expr: Expr) -> Self {
        self.labels.insert(key.into(), expr);
        self
    }

    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn metric(mut self, name: impl Into<String>, metric: Metric) -> Self {
        self.metrics.insert(name.into(), metric);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn build(self) -> Result<Validator> {
        if self.outputs.is_empty() {
            return Err(PinnError::Config(format!(
                "バリデータ '{}' に出力式がありません",
                self.name
            )));
        }
        let out_keys: BTreeSet<&String> = self.outputs.keys().collect();
        let label_keys: BTreeSet<&String> = self.labels.keys().collect();
        if out_keys != label_keys {
            return Err(PinnError::Config(format!(
                "バリデータ '{}': 出力 {:?} とラベル {:?} のキーが一致しません",
                self.name, out_keys, label_keys
            )));
        }
        if self.outputs.values().any(|e| e.row_range().is_some()) {
            return Err(PinnError::Config(format!(
                "バリデータ '{}' では行スライスの出力式は使えません",
                self.name
            )));
        }
        let batch_size = self.batch_size.unwrap_or(self.points.len());
        if batch_size == 0 {
            return Err(PinnError::Config(format!(
                "バリデータ '{}' の点群が空です",
                self.name
            )));
        }
        let mut labels = PointSet::new();
        for (key, expr) in &self.labels {
            labels.insert(key.clone(), expr.eval_points(&self.points)?)?;
        }
        Ok(Validator {
            name: self.name,
            points: self.points,
            output_expr: self.outputs,
            labels,
            loss: self.loss,
            metrics: self.metrics,
            batch_size,
        })
    }
}

/// 解析解や参照データとモデルの予測を比較する評価器。
#[derive(Debug, Clone)]
pub struct Validator {
    name: String,
    points: PointSet,
    output_expr: BTreeMap<String, Expr>,
    labels: PointSet,
    loss: Loss,
    metrics: BTreeMap<String, Metric>,
    batch_size: usize,
}

impl Validator {
    fn builder(name: impl Into<String>, points: PointSet) -> ValidatorBuilder {
        ValidatorBuilder {
            name: name.into(),
            points,
            outputs: BTreeMap::new(),
            labels: BTreeMap::new(),
            loss: Loss::default(),
            metrics: BTreeMap::new(),
            batch_size: None,
        }
    }

    /// ジオメトリ内部から `total_size` 点を標本化して評価点にします。
    pub fn geometry(
        name: impl Into<String>,
        geom: &dyn Geometry,
        total_size: usize,
        sampling: &Sampling,
        rng: &mut dyn RngCore,
    ) -> Result<ValidatorBuilder> {
        let points = geom.sample_interior(total_size, sampling, rng)?;
        Ok(Self::builder(name, points))
    }

    /// 参照データ（CSV など）の点を評価点にします。
    pub fn data(name: impl Into<String>, points: PointSet) -> ValidatorBuilder {
        Self::builder(name, points)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &PointSet {
        &self.points
    }

    pub fn output_expr(&self) -> &BTreeMap<String, Expr> {
        &self.output_expr
    }

    /// 全評価点での予測を集め、損失と各指標を計算します。
    pub fn validate<B: Backend>(
        &self,
        model: &Mlp<B>,
        device: &B::Device,
    ) -> Result<ValidationReport> {
        let preds = self.predict(model, device)?;

        let mut outputs = BTreeMap::new();
        let mut targets = BTreeMap::new();
        for (key, pred) in &preds {
            let label = self.labels.get(key)?;
            outputs.insert(key.clone(), column::<B>(pred, device));
            targets.insert(key.clone(), column::<B>(label, device));
        }
        let loss = self
            .loss
            .compute(&outputs, &targets, &BTreeMap::new())?
            .into_scalar()
            .elem::<f64>();

        let mut metrics = BTreeMap::new();
        for (metric_name, metric) in &self.metrics {
            let mut by_key = BTreeMap::new();
            for (key, pred) in &preds {
                by_key.insert(key.clone(), metric.compute(pred, self.labels.get(key)?));
            }
            metrics.insert(metric_name.clone(), by_key);
        }
        Ok(ValidationReport { loss, metrics })
    }

    /// バッチごとに出力式を評価し、キーごとの予測列を返します。
    pub fn predict<B: Backend>(
        &self,
        model: &Mlp<B>,
        device: &B::Device,
    ) -> Result<BTreeMap<String, Vec<f32>>> {
        predict_batched(model, &self.points, &self.output_expr, self.batch_size, device)
    }
}

fn column<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(values.to_vec(), [values.len(), 1]), device)
}

/// 点群を `batch_size` ごとに評価して出力式の値を集めます。
pub(crate) fn predict_batched<B: Backend>(
    model: &Mlp<B>,
    points: &PointSet,
    exprs: &BTreeMap<String, Expr>,
    batch_size: usize,
    device: &B::Device,
) -> Result<BTreeMap<String, Vec<f32>>> {
    let mut preds: BTreeMap<String, Vec<f32>> = exprs
        .keys()
        .map(|k| (k.clone(), Vec::with_capacity(points.len())))
        .collect();
    let batch_size = batch_size.max(1);
    let mut start = 0;
    while start < points.len() {
        let end = (start + batch_size).min(points.len());
        let batch = points.slice(start..end)?;
        let eval = Evaluation::new(model, &batch, device)?;
        for (key, expr) in exprs {
            let values = eval
                .evaluate(expr)?
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| PinnError::Shape(format!("{e:?}")))?;
            if let Some(col) = preds.get_mut(key) {
                col.extend(values);
            }
        }
        start = end;
    }
    Ok(preds)
}
