use rand::Rng;

use crate::{profile::LossModel, random::Correlated};

/// States of the 4-state loss chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FourState {
    /// Good reception within a gap period.
    Gap,
    /// Good reception within a burst.
    BurstGood,
    /// Loss within a burst.
    BurstLoss,
    /// Isolated loss within a gap period.
    Isolated,
}

/// Loss decision state for one flow.
#[derive(Debug, Clone)]
pub(crate) enum LossChain {
    Random { percentage: f64, source: Correlated },
    State { p13: f64, p31: f64, p32: f64, p23: f64, p14: f64, state: FourState },
    GilbertElliott { p: f64, r: f64, loss_bad: f64, loss_good: f64, bad: bool },
}

impl LossChain {
    pub(crate) fn new(model: LossModel) -> Self {
        match model {
            LossModel::Random { percentage, correlation } => {
                Self::Random { percentage, source: Correlated::new(correlation) }
            }
            LossModel::State { p13, p31, p32, p23, p14 } => {
                Self::State { p13, p31, p32, p23, p14, state: FourState::Gap }
            }
            LossModel::GilbertElliott { p, r, loss_bad, loss_good } => {
                Self::GilbertElliott { p, r, loss_bad, loss_good, bad: false }
            }
        }
    }

    /// True when the chain would decide exactly like a fresh one, so dropping it loses nothing.
    pub(crate) fn is_resting(&self) -> bool {
        match self {
            Self::Random { source, .. } => source.is_memoryless(),
            Self::State { state, .. } => *state == FourState::Gap,
            Self::GilbertElliott { bad, .. } => !*bad,
        }
    }

    /// Decides the fate of the next packet. Stateful models take the outcome from the current
    /// state, then transition.
    pub(crate) fn should_drop<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        match self {
            Self::Random { percentage, source } => source.chance(rng, *percentage),
            Self::State { p13, p31, p32, p23, p14, state } => {
                let lost = matches!(state, FourState::BurstLoss | FourState::Isolated);
                let u = rng.gen::<f64>() * 100.0;
                *state = match state {
                    FourState::Gap if u < *p14 => FourState::Isolated,
                    FourState::Gap if u < *p14 + *p13 => FourState::BurstLoss,
                    FourState::Gap => FourState::Gap,
                    FourState::BurstGood if u < *p23 => FourState::BurstLoss,
                    FourState::BurstGood => FourState::BurstGood,
                    FourState::BurstLoss if u < *p32 => FourState::BurstGood,
                    FourState::BurstLoss if u < *p32 + *p31 => FourState::Gap,
                    FourState::BurstLoss => FourState::BurstLoss,
                    FourState::Isolated => FourState::Gap,
                };
                lost
            }
            Self::GilbertElliott { p, r, loss_bad, loss_good, bad } => {
                let pct = if *bad { *loss_bad } else { *loss_good };
                let lost = pct > 0.0 && rng.gen::<f64>() * 100.0 < pct;
                let u = rng.gen::<f64>() * 100.0;
                *bad = if *bad { u >= *r } else { u < *p };
                lost
            }
        }
    }
}
