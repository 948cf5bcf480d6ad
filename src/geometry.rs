//! 点を標本化できる有界領域。

use crate::data::PointSet;
use crate::error::{PinnError, Result};
use crate::misc::linspace;
use crate::sampler::{SamplerKind, sample_unit};
use rand::Rng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// 標本化の方法。`evenly` が真の場合は `random` を無視して等間隔に配置します。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub random: SamplerKind,
    pub evenly: bool,
}

impl Sampling {
    pub fn evenly() -> Self {
        Self {
            random: SamplerKind::Pseudo,
            evenly: true,
        }
    }

    pub fn random(kind: SamplerKind) -> Self {
        Self {
            random: kind,
            evenly: false,
        }
    }
}

/// 点の標本化に対応した幾何領域。
///
/// 点を受け取るメソッド（`is_inside`, `on_boundary`, `sdf`, `boundary_normal`）の
/// `p` は長さ [`Geometry::ndim`] の座標です。長さの検査はデバッグビルドでのみ行います。
pub trait Geometry: std::fmt::Debug {
    /// 座標列の名前（`x`, `y`, ...）
    fn dim_keys(&self) -> &[String];

    fn ndim(&self) -> usize {
        self.dim_keys().len()
    }

    /// 外接箱の下端と上端
    fn bounds(&self) -> (Vec<f64>, Vec<f64>);

    fn is_inside(&self, p: &[f64]) -> bool;

    fn on_boundary(&self, p: &[f64]) -> bool;

    /// 境界までの距離（内部で正）
    fn sdf(&self, p: &[f64]) -> f64;

    fn boundary_normal(&self, p: &[f64]) -> Vec<f64>;

    fn uniform_points(&self, n: usize, boundary: bool) -> Vec<Vec<f64>>;

    fn random_points(&self, n: usize, kind: SamplerKind, rng: &mut dyn RngCore) -> Vec<Vec<f64>>;

    fn uniform_boundary_points(&self, n: usize) -> Vec<Vec<f64>>;

    fn random_boundary_points(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Vec<f64>>;

    /// 内部点を標本化し、座標列と `sdf` 列を持つ点群を返します。
    fn sample_interior(
        &self,
        n: usize,
        sampling: &Sampling,
        rng: &mut dyn RngCore,
    ) -> Result<PointSet> {
        if n == 0 {
            return Err(PinnError::Geometry("標本点の数が 0 です".to_string()));
        }
        let points = if sampling.evenly {
            self.uniform_points(n, true)
        } else {
            self.random_points(n, sampling.random, rng)
        };
        let mut set = PointSet::from_rows(self.dim_keys(), &points)?;
        set.insert(
            "sdf",
            points.iter().map(|p| self.sdf(p) as f32).collect(),
        )?;
        Ok(set)
    }

    /// 境界点を標本化し、座標列と `normal_<key>` 列を持つ点群を返します。
    fn sample_boundary(
        &self,
        n: usize,
        sampling: &Sampling,
        rng: &mut dyn RngCore,
    ) -> Result<PointSet> {
        if n == 0 {
            return Err(PinnError::Geometry("標本点の数が 0 です".to_string()));
        }
        let points = if sampling.evenly {
            self.uniform_boundary_points(n)
        } else {
            self.random_boundary_points(n, rng)
        };
        let mut set = PointSet::from_rows(self.dim_keys(), &points)?;
        let normals: Vec<Vec<f64>> = points.iter().map(|p| self.boundary_normal(p)).collect();
        for (k, key) in self.dim_keys().iter().enumerate() {
            set.insert(
                format!("normal_{key}"),
                normals.iter().map(|nv| nv[k] as f32).collect(),
            )?;
        }
        Ok(set)
    }
}

const BOUNDARY_TOL: f64 = 1e-6;

/// 1次元の区間 `[l, r]`。
#[derive(Debug, Clone)]
pub struct Interval {
    l: f64,
    r: f64,
    keys: Vec<String>,
}

impl Interval {
    pub fn new(l: f64, r: f64) -> Result<Self> {
        if !(l < r) {
            return Err(PinnError::Geometry(format!(
                "区間の端点が不正です: [{l}, {r}]"
            )));
        }
        Ok(Self {
            l,
            r,
            keys: vec!["x".to_string()],
        })
    }

    pub fn length(&self) -> f64 {
        self.r - self.l
    }
}

impl Geometry for Interval {
    fn dim_keys(&self) -> &[String] {
        &self.keys
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![self.l], vec![self.r])
    }

    fn is_inside(&self, p: &[f64]) -> bool {
        debug_assert_eq!(p.len(), 1, "区間の点は1次元です");
        self.l <= p[0] && p[0] <= self.r
    }

    fn on_boundary(&self, p: &[f64]) -> bool {
        debug_assert_eq!(p.len(), 1, "区間の点は1次元です");
        (p[0] - self.l).abs() < BOUNDARY_TOL || (p[0] - self.r).abs() < BOUNDARY_TOL
    }

    fn sdf(&self, p: &[f64]) -> f64 {
        debug_assert_eq!(p.len(), 1, "区間の点は1次元です");
        (p[0] - self.l).min(self.r - p[0])
    }

    fn boundary_normal(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), 1, "区間の点は1次元です");
        if (p[0] - self.l).abs() < BOUNDARY_TOL {
            vec![-1.0]
        } else if (p[0] - self.r).abs() < BOUNDARY_TOL {
            vec![1.0]
        } else {
            vec![0.0]
        }
    }

    fn uniform_points(&self, n: usize, boundary: bool) -> Vec<Vec<f64>> {
        let xs = if boundary {
            linspace(self.l, self.r, n)
        } else {
            let mut xs = linspace(self.l, self.r, n + 2);
            xs.remove(0);
            xs.pop();
            xs
        };
        xs.into_iter().map(|x| vec![x]).collect()
    }

    fn random_points(&self, n: usize, kind: SamplerKind, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        sample_unit(kind, n, 1, rng)
            .into_iter()
            .map(|p| vec![self.l + p[0] * self.length()])
            .collect()
    }

    fn uniform_boundary_points(&self, n: usize) -> Vec<Vec<f64>> {
        if n == 1 {
            return vec![vec![self.l]];
        }
        let half = n / 2;
        (0..n)
            .map(|i| vec![if i < half { self.l } else { self.r }])
            .collect()
    }

    fn random_boundary_points(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| vec![if rng.random::<bool>() { self.l } else { self.r }])
            .collect()
    }
}

/// 2次元の長方形 `[x0, x1] × [y0, y1]`。
#[derive(Debug, Clone)]
pub struct Rectangle {
    lower: [f64; 2],
    upper: [f64; 2],
    keys: Vec<String>,
}

impl Rectangle {
    pub fn new(lower: [f64; 2], upper: [f64; 2]) -> Result<Self> {
        if !(lower[0] < upper[0] && lower[1] < upper[1]) {
            return Err(PinnError::Geometry(format!(
                "長方形の頂点が不正です: {lower:?}, {upper:?}"
            )));
        }
        Ok(Self {
            lower,
            upper,
            keys: vec!["x".to_string(), "y".to_string()],
        })
    }

    fn side(&self) -> [f64; 2] {
        [self.upper[0] - self.lower[0], self.upper[1] - self.lower[1]]
    }

    fn perimeter(&self) -> f64 {
        let [w, h] = self.side();
        2.0 * (w + h)
    }

    /// 左下の頂点から反時計回りに弧長 `s` 進んだ境界上の点。
    fn point_on_perimeter(&self, s: f64) -> Vec<f64> {
        let [w, h] = self.side();
        let [x0, y0] = self.lower;
        let [x1, y1] = self.upper;
        let s = s.rem_euclid(self.perimeter());
        if s < w {
            vec![x0 + s, y0]
        } else if s < w + h {
            vec![x1, y0 + (s - w)]
        } else if s < 2.0 * w + h {
            vec![x1 - (s - w - h), y1]
        } else {
            vec![x0, y1 - (s - 2.0 * w - h)]
        }
    }
}

impl Geometry for Rectangle {
    fn dim_keys(&self) -> &[String] {
        &self.keys
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (self.lower.to_vec(), self.upper.to_vec())
    }

    fn is_inside(&self, p: &[f64]) -> bool {
        debug_assert_eq!(p.len(), 2, "長方形の点は2次元です");
        (0..2).all(|k| self.lower[k] <= p[k] && p[k] <= self.upper[k])
    }

    fn on_boundary(&self, p: &[f64]) -> bool {
        debug_assert_eq!(p.len(), 2, "長方形の点は2次元です");
        let within = (0..2).all(|k| {
            self.lower[k] - BOUNDARY_TOL <= p[k] && p[k] <= self.upper[k] + BOUNDARY_TOL
        });
        within && self.sdf(p).abs() < BOUNDARY_TOL
    }

    fn sdf(&self, p: &[f64]) -> f64 {
        debug_assert_eq!(p.len(), 2, "長方形の点は2次元です");
        (0..2)
            .map(|k| (p[k] - self.lower[k]).min(self.upper[k] - p[k]))
            .fold(f64::INFINITY, f64::min)
    }

    fn boundary_normal(&self, p: &[f64]) -> Vec<f64> {
        debug_assert_eq!(p.len(), 2, "長方形の点は2次元です");
        if (p[0] - self.lower[0]).abs() < BOUNDARY_TOL {
            vec![-1.0, 0.0]
        } else if (p[0] - self.upper[0]).abs() < BOUNDARY_TOL {
            vec![1.0, 0.0]
        } else if (p[1] - self.lower[1]).abs() < BOUNDARY_TOL {
            vec![0.0, -1.0]
        } else if (p[1] - self.upper[1]).abs() < BOUNDARY_TOL {
            vec![0.0, 1.0]
        } else {
            vec![0.0, 0.0]
        }
    }

    fn uniform_points(&self, n: usize, boundary: bool) -> Vec<Vec<f64>> {
        let [w, h] = self.side();
        let nx = ((n as f64 * w / h).sqrt().ceil() as usize).max(1);
        let ny = ((n as f64 / nx as f64).ceil() as usize).max(1);
        let axis = |lo: f64, hi: f64, m: usize| {
            if boundary {
                linspace(lo, hi, m)
            } else {
                let mut v = linspace(lo, hi, m + 2);
                v.remove(0);
                v.pop();
                v
            }
        };
        let xs = axis(self.lower[0], self.upper[0], nx);
        let ys = axis(self.lower[1], self.upper[1], ny);
        if nx * ny != n {
            tracing::warn!("{} 点を要求しましたが格子上の {} 点を標本化しました", n, nx * ny);
        }
        ys.iter()
            .flat_map(|&y| xs.iter().map(move |&x| vec![x, y]))
            .collect()
    }

    fn random_points(&self, n: usize, kind: SamplerKind, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        let [w, h] = self.side();
        sample_unit(kind, n, 2, rng)
            .into_iter()
            .map(|p| vec![self.lower[0] + p[0] * w, self.lower[1] + p[1] * h])
            .collect()
    }

    fn uniform_boundary_points(&self, n: usize) -> Vec<Vec<f64>> {
        let step = self.perimeter() / n as f64;
        (0..n).map(|i| self.point_on_perimeter(step * i as f64)).collect()
    }

    fn random_boundary_points(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        let perimeter = self.perimeter();
        (0..n)
            .map(|_| self.point_on_perimeter(rng.random::<f64>() * perimeter))
            .collect()
    }
}
