//! Receive throughput reporting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bytes moved and wall-clock time spent moving them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Throughput {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Average rate in bytes per second, or `None` when no time elapsed.
    pub fn bytes_per_second(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            Some(self.bytes as f64 / secs)
        } else {
            None
        }
    }
}

fn human_size(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes_per_second() {
            Some(rate) => write!(
                f,
                "{} in {:.3}s ({}/s)",
                human_size(self.bytes as f64),
                self.elapsed.as_secs_f64(),
                human_size(rate)
            ),
            None => write!(f, "{} in 0s", human_size(self.bytes as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_and_display() {
        let t = Throughput::new(2 * 1024 * 1024, Duration::from_secs(2));
        assert_eq!(t.bytes_per_second(), Some(1024.0 * 1024.0));
        assert_eq!(t.to_string(), "2.00 MB in 2.000s (1.00 MB/s)");
    }

    #[test]
    fn test_zero_elapsed() {
        let t = Throughput::new(500, Duration::ZERO);
        assert_eq!(t.bytes_per_second(), None);
        assert_eq!(t.to_string(), "500 B in 0s");
    }
}
