use burn::tensor::backend::Backend;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// バックエンドと点サンプリング用の乱数生成器に同じシードを設定します。
pub fn set_random_seed<B: Backend>(seed: u64) -> StdRng {
    B::seed(seed);
    StdRng::seed_from_u64(seed)
}

/// `start` から `end` まで（両端を含む）の等間隔な `n` 点。
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// 直近の値と平均を保持するメーター。損失や1イテレーションの所要時間の記録に使います。
#[derive(Debug, Clone)]
pub struct AverageMeter {
    pub name: String,
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            val: 0.0,
            sum: 0.0,
            count: 0,
            avg: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0;
        self.avg = 0.0;
    }

    /// `n` 個分のサンプルの平均値として `value` を記録します。
    pub fn update(&mut self, value: f64, n: usize) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_both_ends() {
        let v = linspace(0.0, 1.0, 5);
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn average_meter_weights_by_count() {
        let mut m = AverageMeter::new("loss");
        m.update(1.0, 1);
        m.update(4.0, 3);
        assert_eq!(m.val, 4.0);
        assert_eq!(m.count, 4);
        assert!((m.avg - 13.0 / 4.0).abs() < 1e-12);
        m.reset();
        assert_eq!(m.count, 0);
        assert_eq!(m.avg, 0.0);
    }
}
