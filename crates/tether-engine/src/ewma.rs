/// Exponentially weighted moving average.
///
/// Smooths per-cycle scores and per-cluster performance samples. A higher
/// `alpha` follows the input more closely; a lower one keeps more history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    value: f64,
    alpha: f64,
    initialized: bool,
}

impl Ewma {
    /// Creates a filter with smoothing factor `0.0 < alpha <= 1.0`.
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha,
            initialized: false,
        }
    }

    /// Restores a filter that already holds `value`.
    pub fn seeded(alpha: f64, value: f64) -> Self {
        Self {
            value,
            alpha,
            initialized: true,
        }
    }

    /// Feeds a measurement. The first finite measurement seeds the value;
    /// NaN and infinities are ignored.
    pub fn update(&mut self, measurement: f64) -> f64 {
        if !measurement.is_finite() {
            return self.value;
        }
        if self.initialized {
            self.value = self.alpha * measurement + (1.0 - self.alpha) * self.value;
        } else {
            self.value = measurement;
            self.initialized = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
