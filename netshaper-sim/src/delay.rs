use std::time::Duration;

use netshaper_common::pct_to_prob;
use rand::Rng;
use rand_distr::{Distribution, Normal, Pareto};

use crate::profile::{DelayDistribution, DelayProfile};

/// Pareto shape used for heavy-tailed jitter. With scale 1 its mean is `shape / (shape - 1)`.
const PARETO_SHAPE: f64 = 3.0;
const PARETO_MEAN: f64 = PARETO_SHAPE / (PARETO_SHAPE - 1.0);

/// Converts fractional milliseconds to a [`Duration`] with nanosecond rounding, so whole
/// millisecond values convert exactly.
pub(crate) fn ms_to_duration(ms: f64) -> Duration {
    Duration::from_nanos((ms.max(0.0) * 1_000_000.0).round() as u64)
}

/// A delay draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DelaySample {
    pub(crate) delay: Duration,
    /// Absolute deviation from the base delay after clamping.
    pub(crate) jitter: Duration,
}

/// Samples `base + offset`, where the offset follows the profile's distribution and may be
/// correlated with the previous offset.
#[derive(Debug, Clone)]
pub(crate) struct DelaySampler {
    profile: DelayProfile,
    rho: f64,
    last_offset: Option<f64>,
}

impl DelaySampler {
    pub(crate) fn new(profile: DelayProfile) -> Self {
        Self { profile, rho: pct_to_prob(profile.correlation), last_offset: None }
    }

    pub(crate) fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> DelaySample {
        let base = self.profile.base_ms;
        let jitter = self.profile.jitter_ms;

        if jitter == 0.0 {
            return DelaySample { delay: ms_to_duration(base), jitter: Duration::ZERO };
        }

        let raw = offset(rng, self.profile.distribution, jitter);
        let offset = match self.last_offset {
            Some(last) if self.rho > 0.0 => (1.0 - self.rho) * raw + self.rho * last,
            _ => raw,
        };
        self.last_offset = Some(offset);

        let delay_ms = (base + offset).max(0.0);
        DelaySample {
            delay: ms_to_duration(delay_ms),
            jitter: ms_to_duration((delay_ms - base).abs()),
        }
    }
}

fn offset<R: Rng + ?Sized>(rng: &mut R, distribution: DelayDistribution, jitter: f64) -> f64 {
    match distribution {
        DelayDistribution::Uniform => rng.gen_range(-jitter..=jitter),
        DelayDistribution::Normal => normal(rng, jitter),
        DelayDistribution::Pareto => pareto(rng, jitter),
        DelayDistribution::ParetoNormal => 0.25 * normal(rng, jitter) + 0.75 * pareto(rng, jitter),
    }
}

/// `N(0, jitter / 3)` clamped to three sigma.
fn normal<R: Rng + ?Sized>(rng: &mut R, jitter: f64) -> f64 {
    Normal::new(0.0, jitter / 3.0).map_or(0.0, |d| d.sample(rng)).clamp(-jitter, jitter)
}

/// Pareto shifted to zero mean and scaled by the jitter. Bounded below by
/// `-jitter * (mean - 1)`, unbounded above.
fn pareto<R: Rng + ?Sized>(rng: &mut R, jitter: f64) -> f64 {
    let x = Pareto::new(1.0, PARETO_SHAPE).map_or(PARETO_MEAN, |d| d.sample(rng));
    jitter * (x - PARETO_MEAN)
}
