//! EWMA realized-volatility estimator over mid-price returns.

/// Exponentially weighted variance of simple mid returns. `sigma()` is the
/// per-update return standard deviation (dimensionless; ~1e-4 is 1 bp).
pub struct EwmaVolatility {
    alpha: f64,
    last_mid: Option<f64>,
    var: f64,
}

impl EwmaVolatility {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            last_mid: None,
            var: 0.0,
        }
    }

    pub fn update(&mut self, mid: f64) {
        if let Some(prev) = self.last_mid {
            if prev > 0.0 {
                let r = (mid - prev) / prev;
                self.var = self.alpha * r * r + (1.0 - self.alpha) * self.var;
            }
        }
        self.last_mid = Some(mid);
    }

    pub fn sigma(&self) -> f64 {
        self.var.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_mid_has_zero_sigma() {
        let mut vol = EwmaVolatility::new(0.1);
        for _ in 0..50 {
            vol.update(10_000.0);
        }
        assert_eq!(vol.sigma(), 0.0);
    }

    #[test]
    fn oscillation_raises_sigma() {
        let mut vol = EwmaVolatility::new(0.1);
        for i in 0..50 {
            vol.update(if i % 2 == 0 { 10_000.0 } else { 10_100.0 });
        }
        assert!(vol.sigma() > 0.001);
    }

    #[test]
    fn decays_after_calm_returns() {
        let mut vol = EwmaVolatility::new(0.2);
        vol.update(10_000.0);
        vol.update(10_500.0);
        let spike = vol.sigma();
        for _ in 0..100 {
            vol.update(10_500.0);
        }
        assert!(vol.sigma() < spike / 10.0);
    }
}
