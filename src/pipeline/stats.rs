//! Rolling Z-score statistics over the calendar spread.
//!
//! Pure stateful accumulator: bounded FIFO of the last 100 observations,
//! population stddev, fixed classification thresholds. No side effects.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

const WINDOW_CAPACITY: usize = 100;
const MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interpretation {
    ExtremelyHigh,
    VeryHigh,
    High,
    ModeratelyHigh,
    Normal,
    ModeratelyLow,
    Low,
    VeryLow,
    ExtremelyLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtremeLevel {
    Extreme,
    VeryUnusual,
    Unusual,
    Notable,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadZScore {
    pub z_score: f64,
    pub interpretation: Interpretation,
    pub extreme_level: ExtremeLevel,
    /// Rank of the current value among the window values, in percent.
    pub percentile: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
}

/// Explicit statuses instead of numeric artifacts: too few samples and a
/// flat window are values a consumer must handle, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZScoreResult {
    InsufficientData { sample_count: usize },
    NoVolatility { mean: f64, sample_count: usize },
    Ok(SpreadZScore),
}

impl ZScoreResult {
    pub fn z_score(&self) -> Option<f64> {
        match self {
            ZScoreResult::Ok(s) => Some(s.z_score),
            _ => None,
        }
    }
}

/// Rolling-window spread statistics. Window is append-only with FIFO
/// eviction past capacity; cleared only by an explicit session reset.
#[derive(Debug, Clone)]
pub struct SpreadStatistics {
    window: Arc<Mutex<VecDeque<f64>>>,
}

impl Default for SpreadStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl SpreadStatistics {
    pub fn new() -> Self {
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY))),
        }
    }

    pub fn observe(&self, spread: f64) -> ZScoreResult {
        let mut window = self.window.lock();
        window.push_back(spread);
        while window.len() > WINDOW_CAPACITY {
            window.pop_front();
        }

        let n = window.len();
        if n < MIN_SAMPLES {
            return ZScoreResult::InsufficientData { sample_count: n };
        }

        let mean = window.iter().sum::<f64>() / n as f64;
        let variance = window
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        let std_dev = variance.sqrt();

        if std_dev == 0.0 || !std_dev.is_finite() {
            return ZScoreResult::NoVolatility {
                mean,
                sample_count: n,
            };
        }

        let z = (spread - mean) / std_dev;
        let rank = window.iter().filter(|v| **v <= spread).count();
        let percentile = rank as f64 / n as f64 * 100.0;

        ZScoreResult::Ok(SpreadZScore {
            z_score: z,
            interpretation: interpret(z),
            extreme_level: extreme_level(z),
            percentile,
            mean,
            std_dev,
            sample_count: n,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.window.lock().len()
    }

    /// Session reset: the only path that clears the window.
    pub fn reset(&self) {
        self.window.lock().clear();
    }
}

fn interpret(z: f64) -> Interpretation {
    let abs = z.abs();
    let high = z > 0.0;
    if abs > 3.0 {
        if high {
            Interpretation::ExtremelyHigh
        } else {
            Interpretation::ExtremelyLow
        }
    } else if abs > 2.0 {
        if high {
            Interpretation::VeryHigh
        } else {
            Interpretation::VeryLow
        }
    } else if abs > 1.5 {
        if high {
            Interpretation::High
        } else {
            Interpretation::Low
        }
    } else if abs > 1.0 {
        if high {
            Interpretation::ModeratelyHigh
        } else {
            Interpretation::ModeratelyLow
        }
    } else {
        Interpretation::Normal
    }
}

fn extreme_level(z: f64) -> ExtremeLevel {
    let abs = z.abs();
    if abs > 2.5 {
        ExtremeLevel::Extreme
    } else if abs > 2.0 {
        ExtremeLevel::VeryUnusual
    } else if abs > 1.5 {
        ExtremeLevel::Unusual
    } else if abs > 1.0 {
        ExtremeLevel::Notable
    } else {
        ExtremeLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_nine_observations_are_insufficient() {
        let stats = SpreadStatistics::new();
        for i in 0..9 {
            let result = stats.observe(10.0 + i as f64);
            assert!(
                matches!(result, ZScoreResult::InsufficientData { .. }),
                "observation {} should be insufficient, got {:?}",
                i + 1,
                result
            );
        }
        let tenth = stats.observe(12.0);
        assert!(matches!(tenth, ZScoreResult::Ok(_)));
    }

    #[test]
    fn outlier_classifies_extreme() {
        let stats = SpreadStatistics::new();
        let values = [10.0, 12.0, 11.0, 13.0, 12.0, 14.0, 11.0, 12.0, 13.0];
        for v in values {
            stats.observe(v);
        }
        let result = stats.observe(50.0);
        let ZScoreResult::Ok(score) = result else {
            panic!("expected a numeric score, got {:?}", result);
        };
        assert!(score.z_score > 2.0, "z = {}", score.z_score);
        assert_eq!(score.extreme_level, ExtremeLevel::Extreme);
        assert_eq!(score.percentile, 100.0);
    }

    #[test]
    fn flat_window_reports_no_volatility() {
        let stats = SpreadStatistics::new();
        for _ in 0..10 {
            let _ = stats.observe(5.0);
        }
        let result = stats.observe(5.0);
        assert!(matches!(result, ZScoreResult::NoVolatility { mean, .. } if mean == 5.0));
    }

    #[test]
    fn window_is_bounded_at_capacity() {
        let stats = SpreadStatistics::new();
        for i in 0..250 {
            let _ = stats.observe(i as f64);
        }
        assert_eq!(stats.sample_count(), WINDOW_CAPACITY);
    }

    #[test]
    fn negative_z_classifies_low_side() {
        let stats = SpreadStatistics::new();
        let values = [10.0, 12.0, 11.0, 13.0, 12.0, 14.0, 11.0, 12.0, 13.0];
        for v in values {
            stats.observe(v);
        }
        let result = stats.observe(-30.0);
        let ZScoreResult::Ok(score) = result else {
            panic!("expected a numeric score");
        };
        assert!(score.z_score < -2.0);
        assert!(matches!(
            score.interpretation,
            Interpretation::VeryLow | Interpretation::ExtremelyLow
        ));
    }

    #[test]
    fn reset_clears_session() {
        let stats = SpreadStatistics::new();
        for i in 0..20 {
            let _ = stats.observe(i as f64);
        }
        stats.reset();
        assert_eq!(stats.sample_count(), 0);
        assert!(matches!(
            stats.observe(1.0),
            ZScoreResult::InsufficientData { sample_count: 1 }
        ));
    }
}
