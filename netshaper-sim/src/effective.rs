use crate::{
    profile::{
        BandwidthProfile, CorruptProfile, DelayDistribution, DelayProfile, DuplicateProfile,
        ImpairmentProfile, LossModel, ProfileKind, ReorderMode, ReorderProfile,
    },
    ProfileError,
};

/// The set of effects in force, at most one per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EffectiveImpairment {
    pub loss: Option<LossModel>,
    pub duplicate: Option<DuplicateProfile>,
    pub corrupt: Option<CorruptProfile>,
    pub reorder: Option<ReorderProfile>,
    pub delay: Option<DelayProfile>,
    pub bandwidth: Option<BandwidthProfile>,
}

impl EffectiveImpairment {
    /// Collects `profiles` into one effect set. Fails if a profile is invalid, or if two
    /// profiles share a kind; `owner` names the scenario in that error.
    pub fn try_from_profiles<'a>(
        owner: &str,
        profiles: impl IntoIterator<Item = &'a ImpairmentProfile>,
    ) -> Result<Self, ProfileError> {
        let mut effect = Self::default();
        for profile in profiles {
            profile.validate()?;
            if effect.get(profile.kind()).is_some() {
                return Err(ProfileError::DuplicateKind {
                    scenario: owner.to_string(),
                    kind: profile.kind(),
                });
            }
            effect.set(*profile);
        }

        Ok(effect)
    }

    /// Sets the profile of `profile`'s kind, replacing any previous one.
    pub fn set(&mut self, profile: ImpairmentProfile) {
        match profile {
            ImpairmentProfile::Loss(p) => self.loss = Some(p),
            ImpairmentProfile::Duplicate(p) => self.duplicate = Some(p),
            ImpairmentProfile::Corrupt(p) => self.corrupt = Some(p),
            ImpairmentProfile::Reorder(p) => self.reorder = Some(p),
            ImpairmentProfile::Delay(p) => self.delay = Some(p),
            ImpairmentProfile::Bandwidth(p) => self.bandwidth = Some(p),
        }
    }

    pub fn get(&self, kind: ProfileKind) -> Option<ImpairmentProfile> {
        match kind {
            ProfileKind::Loss => self.loss.map(ImpairmentProfile::Loss),
            ProfileKind::Duplicate => self.duplicate.map(ImpairmentProfile::Duplicate),
            ProfileKind::Corrupt => self.corrupt.map(ImpairmentProfile::Corrupt),
            ProfileKind::Reorder => self.reorder.map(ImpairmentProfile::Reorder),
            ProfileKind::Delay => self.delay.map(ImpairmentProfile::Delay),
            ProfileKind::Bandwidth => self.bandwidth.map(ImpairmentProfile::Bandwidth),
        }
    }

    /// The profiles in application order.
    pub fn profiles(&self) -> Vec<ImpairmentProfile> {
        [
            self.loss.map(ImpairmentProfile::Loss),
            self.duplicate.map(ImpairmentProfile::Duplicate),
            self.corrupt.map(ImpairmentProfile::Corrupt),
            self.reorder.map(ImpairmentProfile::Reorder),
            self.delay.map(ImpairmentProfile::Delay),
            self.bandwidth.map(ImpairmentProfile::Bandwidth),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        self.profiles().iter().try_for_each(ImpairmentProfile::validate)
    }

    /// Returns `self` with every kind present in `overlay` replaced by the overlay's profile.
    pub fn layered(&self, overlay: &Self) -> Self {
        Self {
            loss: overlay.loss.or(self.loss),
            duplicate: overlay.duplicate.or(self.duplicate),
            corrupt: overlay.corrupt.or(self.corrupt),
            reorder: overlay.reorder.or(self.reorder),
            delay: overlay.delay.or(self.delay),
            bandwidth: overlay.bandwidth.or(self.bandwidth),
        }
    }

    /// Flattens the effect set into the parameters an OS driver needs.
    pub fn describe(&self) -> ImpairmentDescription {
        let mut desc = ImpairmentDescription::default();

        if let Some(delay) = self.delay {
            desc.delay_ms = delay.base_ms;
            desc.jitter_ms = delay.jitter_ms;
            desc.delay_correlation = delay.correlation;
            desc.distribution = Some(delay.distribution);
        }
        if let Some(loss) = self.loss {
            desc.loss_pct = loss.mean_loss_pct().unwrap_or_default();
            if let LossModel::Random { correlation, .. } = loss {
                desc.loss_correlation = correlation;
            }
            desc.loss_model = Some(loss);
        }
        if let Some(duplicate) = self.duplicate {
            desc.duplicate_pct = duplicate.percentage;
        }
        if let Some(corrupt) = self.corrupt {
            desc.corrupt_pct = corrupt.percentage;
        }
        if let Some(reorder) = self.reorder {
            desc.reorder_pct = reorder.percentage;
            desc.reorder_gap = (reorder.mode == ReorderMode::Gap).then_some(reorder.gap);
        }
        if let Some(bandwidth) = self.bandwidth {
            desc.rate_kbit = Some(bandwidth.rate_kbit);
            desc.burst_bytes = Some(bandwidth.effective_burst_bytes());
        }

        desc
    }
}

/// A declarative summary of an effect set, consumed by
/// [`ImpairmentDriver`](crate::ImpairmentDriver)s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpairmentDescription {
    pub delay_ms: f64,
    pub jitter_ms: f64,
    pub delay_correlation: f64,
    /// `None` when no delay is configured.
    pub distribution: Option<DelayDistribution>,
    /// Long-run loss percentage. For stateful models this is the stationary loss share.
    pub loss_pct: f64,
    pub loss_correlation: f64,
    pub loss_model: Option<LossModel>,
    pub duplicate_pct: f64,
    pub corrupt_pct: f64,
    pub reorder_pct: f64,
    /// Set for gap-based reordering only.
    pub reorder_gap: Option<u32>,
    pub rate_kbit: Option<u64>,
    pub burst_bytes: Option<u32>,
}

impl ImpairmentDescription {
    /// Returns `true` if the description has no effect.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }

    /// Renders the description as `tc qdisc ... netem` arguments, e.g.
    /// `["delay", "100ms", "10ms", "distribution", "normal", "loss", "5%"]`.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.delay_ms > 0.0 || self.jitter_ms > 0.0 {
            args.push("delay".to_string());
            args.push(format!("{}ms", self.delay_ms));
            if self.jitter_ms > 0.0 {
                args.push(format!("{}ms", self.jitter_ms));
                if self.delay_correlation > 0.0 {
                    args.push(pct(self.delay_correlation));
                }
                match self.distribution {
                    Some(DelayDistribution::Uniform) | None => {}
                    Some(distribution) => {
                        args.push("distribution".to_string());
                        args.push(distribution.to_string());
                    }
                }
            }
        }

        match self.loss_model {
            Some(LossModel::Random { percentage, correlation }) if percentage > 0.0 => {
                args.push("loss".to_string());
                args.push(pct(percentage));
                if correlation > 0.0 {
                    args.push(pct(correlation));
                }
            }
            Some(LossModel::State { p13, p31, p32, p23, p14 }) => {
                args.extend(["loss".to_string(), "state".to_string()]);
                args.extend([p13, p31, p32, p23, p14].map(pct));
            }
            Some(LossModel::GilbertElliott { p, r, loss_bad, loss_good }) => {
                args.extend(["loss".to_string(), "gemodel".to_string()]);
                args.extend([p, r, loss_bad, loss_good].map(pct));
            }
            _ => {}
        }

        if self.duplicate_pct > 0.0 {
            args.push("duplicate".to_string());
            args.push(pct(self.duplicate_pct));
        }

        if self.reorder_pct > 0.0 {
            args.push("reorder".to_string());
            args.push(pct(self.reorder_pct));
            if let Some(gap) = self.reorder_gap {
                args.push("gap".to_string());
                args.push(gap.to_string());
            }
        }

        if self.corrupt_pct > 0.0 {
            args.push("corrupt".to_string());
            args.push(pct(self.corrupt_pct));
        }

        if let Some(rate) = self.rate_kbit {
            args.push("rate".to_string());
            args.push(format!("{rate}kbit"));
        }

        args
    }
}

fn pct(value: f64) -> String {
    format!("{value}%")
}
