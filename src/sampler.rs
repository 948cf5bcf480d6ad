//! 単位超立方体 `[0, 1)^d` 上の点列生成（擬似乱数・準乱数）。

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const PRIMES: [u64; 16] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

/// 点列の生成方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SamplerKind {
    /// 一様乱数
    #[default]
    Pseudo,
    Halton,
    Hammersley,
    /// ラテン超方格
    Lhs,
}

/// `base` 進数でのラディカル逆関数（van der Corput 列）。
pub fn radical_inverse(mut i: u64, base: u64) -> f64 {
    let mut inv_base = 1.0 / base as f64;
    let mut result = 0.0;
    while i > 0 {
        result += (i % base) as f64 * inv_base;
        i /= base;
        inv_base /= base as f64;
    }
    result
}

fn prime(k: usize) -> u64 {
    PRIMES[k % PRIMES.len()]
}

/// `[0, 1)^dim` 上に `n` 点を生成します。戻り値は点ごとの座標ベクトルです。
pub fn sample_unit<R: Rng + ?Sized>(
    kind: SamplerKind,
    n: usize,
    dim: usize,
    rng: &mut R,
) -> Vec<Vec<f64>> {
    match kind {
        SamplerKind::Pseudo => (0..n)
            .map(|_| (0..dim).map(|_| rng.random::<f64>()).collect())
            .collect(),
        // 0 番目の点（原点）は捨てる
        SamplerKind::Halton => (1..=n as u64)
            .map(|i| (0..dim).map(|k| radical_inverse(i, prime(k))).collect())
            .collect(),
        SamplerKind::Hammersley if dim == 1 => sample_unit(SamplerKind::Halton, n, dim, rng),
        SamplerKind::Hammersley => {
            let total = (n + 1) as f64;
            (1..=n as u64)
                .map(|j| {
                    let mut p = Vec::with_capacity(dim);
                    p.push(j as f64 / total);
                    p.extend((1..dim).map(|k| radical_inverse(j, prime(k - 1))));
                    p
                })
                .collect()
        }
        SamplerKind::Lhs => {
            let mut points = vec![vec![0.0; dim]; n];
            for k in 0..dim {
                let mut bins: Vec<usize> = (0..n).collect();
                bins.shuffle(rng);
                for (p, bin) in points.iter_mut().zip(bins) {
                    p[k] = (bin as f64 + rng.random::<f64>()) / n as f64;
                }
            }
            points
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn halton_skips_origin() {
        let mut rng = StdRng::seed_from_u64(0);
        let pts = sample_unit(SamplerKind::Halton, 4, 2, &mut rng);
        let xs: Vec<f64> = pts.iter().map(|p| p[0]).collect();
        let ys: Vec<f64> = pts.iter().map(|p| p[1]).collect();
        assert_eq!(xs, vec![0.5, 0.25, 0.75, 0.125]);
        assert!((ys[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((ys[1] - 2.0 / 3.0).abs() < 1e-12);
        assert!((ys[2] - 1.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn hammersley_first_axis_is_regular() {
        let mut rng = StdRng::seed_from_u64(0);
        let pts = sample_unit(SamplerKind::Hammersley, 3, 2, &mut rng);
        assert_eq!(pts[0][0], 0.25);
        assert_eq!(pts[1][0], 0.5);
        assert_eq!(pts[2][0], 0.75);
        assert_eq!(pts[0][1], 0.5);

        let one_d = sample_unit(SamplerKind::Hammersley, 3, 1, &mut rng);
        assert_eq!(one_d, vec![vec![0.5], vec![0.25], vec![0.75]]);
    }

    #[test]
    fn lhs_puts_one_point_in_each_bin() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 10;
        let pts = sample_unit(SamplerKind::Lhs, n, 2, &mut rng);
        for k in 0..2 {
            let mut bins: Vec<usize> = pts.iter().map(|p| (p[k] * n as f64) as usize).collect();
            bins.sort_unstable();
            assert_eq!(bins, (0..n).collect::<Vec<_>>());
        }
    }

    proptest! {
        #[test]
        fn every_sampler_stays_in_unit_cube(n in 1usize..64, dim in 1usize..4, seed in 0u64..1000) {
            let mut rng = StdRng::seed_from_u64(seed);
            for kind in [
                SamplerKind::Pseudo,
                SamplerKind::Halton,
                SamplerKind::Hammersley,
                SamplerKind::Lhs,
            ] {
                let pts = sample_unit(kind, n, dim, &mut rng);
                prop_assert_eq!(pts.len(), n);
                for p in &pts {
                    prop_assert_eq!(p.len(), dim);
                    prop_assert!(p.iter().all(|&v| (0.0..1.0).contains(&v)));
                }
            }
        }
    }
}
