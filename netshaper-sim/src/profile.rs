//! Impairment profiles.
//!
//! A profile is an immutable value describing one kind of degradation. Each field maps to a
//! feature of Linux's `netem` qdisc, or to `tbf` for bandwidth limiting. Percentages are in
//! `[0, 100]`; out-of-range values are rejected by [`ImpairmentProfile::validate`], never
//! clamped.

use std::{fmt, time::Duration};

use netshaper_common::constants::MTU_ETHERNET;
use serde::Deserialize;

use crate::ProfileError;

/// The effect kinds, in the order the engine applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProfileKind {
    Loss,
    Duplicate,
    Corrupt,
    Reorder,
    Delay,
    Bandwidth,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loss => "loss",
            Self::Duplicate => "duplicate",
            Self::Corrupt => "corrupt",
            Self::Reorder => "reorder",
            Self::Delay => "delay",
            Self::Bandwidth => "bandwidth",
        };
        f.write_str(s)
    }
}

/// Shape of the jitter added on top of the base delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayDistribution {
    /// `U(-jitter, +jitter)`.
    #[default]
    Uniform,
    /// `N(0, jitter / 3)` clamped to `±jitter`.
    Normal,
    /// Heavy-tailed, models bursty queueing latency.
    Pareto,
    /// A quarter normal, three quarters pareto.
    #[serde(alias = "paretonormal")]
    ParetoNormal,
}

impl fmt::Display for DelayDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uniform => "uniform",
            Self::Normal => "normal",
            Self::Pareto => "pareto",
            Self::ParetoNormal => "paretonormal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayProfile {
    /// Constant delay added to every packet, in milliseconds.
    pub base_ms: f64,
    /// Maximum random deviation from the base, in milliseconds.
    pub jitter_ms: f64,
    /// Correlation of successive jitter draws, in percent.
    pub correlation: f64,
    pub distribution: DelayDistribution,
}

impl DelayProfile {
    /// Largest base delay or jitter accepted, one hour.
    pub const MAX_MS: f64 = 3_600_000.0;

    pub const fn new(base_ms: f64, jitter_ms: f64) -> Self {
        Self { base_ms, jitter_ms, correlation: 0.0, distribution: DelayDistribution::Uniform }
    }

    pub const fn distribution(mut self, distribution: DelayDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub const fn correlation(mut self, correlation: f64) -> Self {
        self.correlation = correlation;
        self
    }
}

/// How packets are chosen for loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossModel {
    /// Independent loss with the given percentage. A non-zero correlation makes successive
    /// draws depend on each other.
    Random { percentage: f64, correlation: f64 },
    /// The 4-state Markov model. States 1 and 2 deliver, 3 (burst) and 4 (isolated) lose.
    /// Transition probabilities are percentages.
    State { p13: f64, p31: f64, p32: f64, p23: f64, p14: f64 },
    /// The Gilbert-Elliott model: `p` is Good to Bad, `r` Bad to Good, and `loss_bad` /
    /// `loss_good` the loss percentage within each state.
    GilbertElliott { p: f64, r: f64, loss_bad: f64, loss_good: f64 },
}

impl LossModel {
    pub const fn random(percentage: f64) -> Self {
        Self::Random { percentage, correlation: 0.0 }
    }

    /// Simple Gilbert model: every packet in Bad is lost, none in Good.
    pub const fn gilbert(p: f64, r: f64) -> Self {
        Self::GilbertElliott { p, r, loss_bad: 100.0, loss_good: 0.0 }
    }

    /// Long-run loss percentage. For the 4-state model this is the stationary share of the
    /// loss states, and `None` when the chain can get stuck outside state 1.
    pub fn mean_loss_pct(&self) -> Option<f64> {
        match *self {
            Self::Random { percentage, .. } => Some(percentage),
            Self::GilbertElliott { p, r, loss_bad, loss_good } => {
                if p + r == 0.0 {
                    return Some(loss_good);
                }
                let bad_share = p / (p + r);
                Some(bad_share * loss_bad + (1.0 - bad_share) * loss_good)
            }
            Self::State { p13, p31, p32, p23, p14 } => {
                if p31 == 0.0 || (p32 > 0.0 && p23 == 0.0) {
                    return None;
                }
                // Balance equations with pi1 = 1.
                let pi3 = p13 / p31;
                let pi2 = if p32 == 0.0 { 0.0 } else { pi3 * p32 / p23 };
                let pi4 = p14 / 100.0;
                Some(100.0 * (pi3 + pi4) / (1.0 + pi2 + pi3 + pi4))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateProfile {
    pub percentage: f64,
    pub correlation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorruptProfile {
    pub percentage: f64,
    pub correlation: f64,
    /// Upper bound of bits flipped in a corrupted packet. At least one bit is flipped.
    pub max_flips: u32,
    /// Only the first `window_bytes` of the payload are eligible for corruption.
    pub window_bytes: usize,
}

impl CorruptProfile {
    pub const DEFAULT_WINDOW: usize = 64;

    pub const fn new(percentage: f64) -> Self {
        Self { percentage, correlation: 0.0, max_flips: 1, window_bytes: Self::DEFAULT_WINDOW }
    }
}

/// How a packet selected for reordering is held back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderMode {
    /// A selected packet is held for `gap` service slots.
    #[default]
    Percentage,
    /// Every `gap`-th packet is a candidate. A selected one is released at a random slot in
    /// `1..=gap`.
    Gap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReorderProfile {
    pub percentage: f64,
    pub correlation: f64,
    pub gap: u32,
    pub mode: ReorderMode,
}

impl ReorderProfile {
    pub const fn new(percentage: f64, gap: u32) -> Self {
        Self { percentage, correlation: 0.0, gap, mode: ReorderMode::Percentage }
    }

    pub const fn mode(mut self, mode: ReorderMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthProfile {
    /// Link rate in kilobits per second.
    pub rate_kbit: u64,
    /// Bytes that may pass back to back before the rate applies. Derived from the rate when
    /// unset.
    pub burst_bytes: Option<u32>,
}

impl BandwidthProfile {
    /// Largest rate whose bits per second still fit a `u64`.
    pub const MAX_RATE_KBIT: u64 = u64::MAX / 1000;

    pub const fn new(rate_kbit: u64) -> Self {
        Self { rate_kbit, burst_bytes: None }
    }

    /// Creates a profile from a rate in bits per second, rounding up to whole kilobits.
    pub const fn from_bps(bps: u64) -> Self {
        Self::new(bps.div_ceil(1000))
    }

    /// Link rate in bytes per second.
    pub const fn bytes_per_sec(&self) -> u64 {
        self.rate_kbit.saturating_mul(1000) / 8
    }

    /// The configured burst, or `max(rate / 8 seconds, 10 MTU-sized packets)`.
    pub fn effective_burst_bytes(&self) -> u32 {
        self.burst_bytes.unwrap_or_else(|| {
            let one_eighth_second = (self.bytes_per_sec() / 8).min(u64::from(u32::MAX)) as u32;
            one_eighth_second.max(MTU_ETHERNET * 10)
        })
    }

    /// Time to serialize `bytes` onto the link.
    pub fn transmission_time(&self, bytes: usize) -> Duration {
        netshaper_common::transmission_time(bytes, self.bytes_per_sec())
    }
}

/// One typed impairment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImpairmentProfile {
    Delay(DelayProfile),
    Loss(LossModel),
    Duplicate(DuplicateProfile),
    Corrupt(CorruptProfile),
    Reorder(ReorderProfile),
    Bandwidth(BandwidthProfile),
}

impl ImpairmentProfile {
    pub const fn kind(&self) -> ProfileKind {
        match self {
            Self::Delay(_) => ProfileKind::Delay,
            Self::Loss(_) => ProfileKind::Loss,
            Self::Duplicate(_) => ProfileKind::Duplicate,
            Self::Corrupt(_) => ProfileKind::Corrupt,
            Self::Reorder(_) => ProfileKind::Reorder,
            Self::Bandwidth(_) => ProfileKind::Bandwidth,
        }
    }

    /// Checks every parameter of the profile.
    pub fn validate(&self) -> Result<(), ProfileError> {
        match self {
            Self::Delay(d) => {
                milliseconds("base_ms", d.base_ms)?;
                milliseconds("jitter_ms", d.jitter_ms)?;
                percentage("delay correlation", d.correlation)
            }
            Self::Loss(LossModel::Random { percentage: pct, correlation }) => {
                percentage("loss percentage", *pct)?;
                percentage("loss correlation", *correlation)
            }
            Self::Loss(LossModel::State { p13, p31, p32, p23, p14 }) => {
                percentage("p13", *p13)?;
                percentage("p31", *p31)?;
                percentage("p32", *p32)?;
                percentage("p23", *p23)?;
                percentage("p14", *p14)?;
                percentage("p13 + p14", p13 + p14)?;
                percentage("p31 + p32", p31 + p32)
            }
            Self::Loss(LossModel::GilbertElliott { p, r, loss_bad, loss_good }) => {
                percentage("p", *p)?;
                percentage("r", *r)?;
                percentage("loss_bad", *loss_bad)?;
                percentage("loss_good", *loss_good)
            }
            Self::Duplicate(d) => {
                percentage("duplicate percentage", d.percentage)?;
                percentage("duplicate correlation", d.correlation)
            }
            Self::Corrupt(c) => {
                percentage("corrupt percentage", c.percentage)?;
                percentage("corrupt correlation", c.correlation)?;
                if c.max_flips == 0 {
                    return Err(invalid("max_flips", "must be at least 1"));
                }
                if c.window_bytes == 0 {
                    return Err(invalid("window_bytes", "must be at least 1"));
                }
                Ok(())
            }
            Self::Reorder(r) => {
                percentage("reorder percentage", r.percentage)?;
                percentage("reorder correlation", r.correlation)?;
                if r.gap == 0 {
                    return Err(invalid("gap", "must be at least 1"));
                }
                Ok(())
            }
            Self::Bandwidth(b) => {
                if b.rate_kbit == 0 {
                    return Err(invalid("rate_kbit", "must be positive"));
                }
                if b.rate_kbit > BandwidthProfile::MAX_RATE_KBIT {
                    return Err(invalid("rate_kbit", "must fit in 64 bits as bits per second"));
                }
                if b.burst_bytes == Some(0) {
                    return Err(invalid("burst_bytes", "must be positive"));
                }
                Ok(())
            }
        }
    }
}

const fn invalid(field: &'static str, reason: &'static str) -> ProfileError {
    ProfileError::InvalidParameter { field, reason }
}

fn percentage(field: &'static str, value: f64) -> Result<(), ProfileError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(invalid(field, "must be a percentage in [0, 100]"));
    }
    Ok(())
}

fn milliseconds(field: &'static str, value: f64) -> Result<(), ProfileError> {
    if !(0.0..=DelayProfile::MAX_MS).contains(&value) {
        return Err(invalid(field, "must be between 0 and one hour"));
    }
    Ok(())
}
