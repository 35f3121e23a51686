//! Running extrema over received samples.

/// Running minimum and maximum of every recorded sample.
///
/// The bounds start at the opposite extremes of `f64` so the first recorded
/// value replaces both. After at least one sample has been recorded,
/// `minimum <= value <= maximum` holds for every recorded value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Extrema {
    /// Smallest value seen so far.
    pub minimum: f64,

    /// Largest value seen so far.
    pub maximum: f64,

    /// Number of values recorded since the last reset.
    pub count: u64,
}

impl Extrema {
    /// Create empty extrema seeded with the opposite extremes.
    pub fn new() -> Self {
        Self {
            minimum: f64::MAX,
            maximum: f64::MIN,
            count: 0,
        }
    }

    /// Tighten the bounds with a new value.
    ///
    /// NaN never compares, so it is counted but leaves both bounds unchanged.
    pub fn record(&mut self, value: f64) {
        if value > self.maximum {
            self.maximum = value;
        }
        if value < self.minimum {
            self.minimum = value;
        }
        self.count += 1;
    }

    /// Check if no value has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Get the bounds as `(minimum, maximum)`, or `None` before the first sample.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            None
        } else {
            Some((self.minimum, self.maximum))
        }
    }

    /// Get the spread between the bounds.
    pub fn range(&self) -> Option<f64> {
        self.bounds().map(|(min, max)| max - min)
    }

    /// Check if a value lies within the current bounds.
    pub fn contains(&self, value: f64) -> bool {
        self.minimum <= value && value <= self.maximum
    }
}

impl Default for Extrema {
    fn default() -> Self {
        Self::new()
    }
}
