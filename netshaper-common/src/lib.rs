use std::time::{Duration, SystemTime};

mod classifier;
pub use classifier::{Classifier, FixedClassifier, FlowHashClassifier, SizeClassifier};

mod packet;
pub use packet::{ClassId, FlowId, Packet};

/// Coarse error category shared by every netshaper error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The call introduced invalid configuration. State is unchanged.
    Config,
    /// A queue or bucket is full. The caller decides whether this counts as a drop.
    Capacity,
    /// The instance is not initialized or already shut down.
    State,
}

/// Returns the current UNIX timestamp in microseconds.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Time it takes to serialize `bytes` onto a link running at `rate` bytes per second.
/// Returns [`Duration::ZERO`] for a zero rate, which callers treat as "unlimited".
#[inline]
pub fn transmission_time(bytes: usize, rate: u64) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }

    Duration::from_nanos((bytes as f64 * 1e9 / rate as f64).round() as u64)
}

/// Converts a percentage in `[0, 100]` into a probability in `[0, 1]`.
#[inline]
pub fn pct_to_prob(pct: f64) -> f64 {
    (pct / 100.0).clamp(0.0, 1.0)
}

pub mod constants {
    /// Ethernet MTU in bytes.
    pub const MTU_ETHERNET: u32 = 1500;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmission_time_scales_with_rate() {
        assert_eq!(transmission_time(1500, 1500), Duration::from_secs(1));
        assert_eq!(transmission_time(1500, 150_000), Duration::from_millis(10));
        assert_eq!(transmission_time(1500, 0), Duration::ZERO);
    }

    #[test]
    fn percentages_are_clamped() {
        assert_eq!(pct_to_prob(50.0), 0.5);
        assert_eq!(pct_to_prob(150.0), 1.0);
        assert_eq!(pct_to_prob(-1.0), 0.0);
    }
}
