use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    effective::EffectiveImpairment,
    profile::{
        BandwidthProfile, CorruptProfile, DelayProfile, DuplicateProfile, ImpairmentProfile,
        LossModel, ReorderProfile,
    },
    scenario::{Preset, ResolvedEvent, ResolvedScenario, Scenario, ScenarioEvent},
    ProfileError,
};

#[derive(Debug, Default)]
struct StoreInner {
    profiles: BTreeMap<String, ImpairmentProfile>,
    scenarios: BTreeMap<String, Scenario>,
}

impl StoreInner {
    fn lookup(&self, name: &str) -> Result<ImpairmentProfile, ProfileError> {
        self.profiles
            .get(name)
            .copied()
            .ok_or_else(|| ProfileError::UnknownProfile(name.to_string()))
    }

    /// Checks that every name in `scenario` resolves and that its base holds one profile per
    /// kind.
    fn check(&self, scenario: &Scenario) -> Result<ResolvedScenario, ProfileError> {
        let base = scenario
            .profiles()
            .iter()
            .map(|name| self.lookup(name))
            .collect::<Result<Vec<_>, _>>()?;
        let base = EffectiveImpairment::try_from_profiles(scenario.name(), &base)?;

        let events = scenario
            .events()
            .iter()
            .map(|event| {
                event.validate()?;
                Ok(ResolvedEvent {
                    start_ms: event.start_ms,
                    end_ms: event.end_ms,
                    profile_name: event.profile.clone(),
                    profile: self.lookup(&event.profile)?,
                })
            })
            .collect::<Result<Vec<_>, ProfileError>>()?;

        Ok(ResolvedScenario {
            name: scenario.name().to_string(),
            interface: scenario.interface().to_string(),
            base,
            events,
        })
    }

    fn scenario_mut(&mut self, name: &str) -> Result<&mut Scenario, ProfileError> {
        self.scenarios
            .get_mut(name)
            .ok_or_else(|| ProfileError::UnknownScenario(name.to_string()))
    }
}

/// Named impairment profiles and the scenarios grouping them.
///
/// Every mutation is validated in full before it is applied: a failed call leaves the store
/// unchanged. Profiles are values; a profile referenced by a scenario cannot be removed.
#[derive(Debug, Default)]
pub struct ProfileStore {
    inner: RwLock<StoreInner>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a validated profile under `name`.
    pub fn add_profile(
        &self,
        name: impl Into<String>,
        profile: ImpairmentProfile,
    ) -> Result<(), ProfileError> {
        let name = name.into();
        profile.validate()?;

        let mut inner = self.inner.write();
        if inner.profiles.contains_key(&name) {
            return Err(ProfileError::DuplicateName(name));
        }

        debug!(%name, kind = %profile.kind(), "Added profile");
        inner.profiles.insert(name, profile);
        Ok(())
    }

    pub fn add_delay_profile(
        &self,
        name: impl Into<String>,
        profile: DelayProfile,
    ) -> Result<(), ProfileError> {
        self.add_profile(name, ImpairmentProfile::Delay(profile))
    }

    pub fn add_loss_profile(
        &self,
        name: impl Into<String>,
        model: LossModel,
    ) -> Result<(), ProfileError> {
        self.add_profile(name, ImpairmentProfile::Loss(model))
    }

    pub fn add_duplicate_profile(
        &self,
        name: impl Into<String>,
        profile: DuplicateProfile,
    ) -> Result<(), ProfileError> {
        self.add_profile(name, ImpairmentProfile::Duplicate(profile))
    }

    pub fn add_corrupt_profile(
        &self,
        name: impl Into<String>,
        profile: CorruptProfile,
    ) -> Result<(), ProfileError> {
        self.add_profile(name, ImpairmentProfile::Corrupt(profile))
    }

    pub fn add_reorder_profile(
        &self,
        name: impl Into<String>,
        profile: ReorderProfile,
    ) -> Result<(), ProfileError> {
        self.add_profile(name, ImpairmentProfile::Reorder(profile))
    }

    pub fn add_bandwidth_profile(
        &self,
        name: impl Into<String>,
        profile: BandwidthProfile,
    ) -> Result<(), ProfileError> {
        self.add_profile(name, ImpairmentProfile::Bandwidth(profile))
    }

    pub fn profile(&self, name: &str) -> Option<ImpairmentProfile> {
        self.inner.read().profiles.get(name).copied()
    }

    /// All profiles, sorted by name.
    pub fn profiles(&self) -> Vec<(String, ImpairmentProfile)> {
        self.inner.read().profiles.iter().map(|(name, p)| (name.clone(), *p)).collect()
    }

    /// Removes a profile no scenario refers to.
    pub fn remove_profile(&self, name: &str) -> Result<ImpairmentProfile, ProfileError> {
        let mut inner = self.inner.write();
        if let Some(scenario) = inner.scenarios.values().find(|s| s.references(name)) {
            return Err(ProfileError::ProfileInUse {
                profile: name.to_string(),
                scenario: scenario.name().to_string(),
            });
        }

        let profile = inner
            .profiles
            .remove(name)
            .ok_or_else(|| ProfileError::UnknownProfile(name.to_string()))?;
        debug!(name, "Removed profile");
        Ok(profile)
    }

    /// Adds a scenario. Every profile it names must exist, and its base may hold at most one
    /// profile per kind.
    pub fn add_scenario(&self, scenario: Scenario) -> Result<(), ProfileError> {
        let mut inner = self.inner.write();
        if inner.scenarios.contains_key(scenario.name()) {
            return Err(ProfileError::DuplicateName(scenario.name().to_string()));
        }
        inner.check(&scenario)?;

        info!(
            name = scenario.name(),
            interface = scenario.interface(),
            profiles = scenario.profiles().len(),
            events = scenario.events().len(),
            "Added scenario"
        );
        inner.scenarios.insert(scenario.name().to_string(), scenario);
        Ok(())
    }

    /// Adds the profiles of `preset` as `{name}-{kind}` and a scenario `name` grouping them.
    pub fn add_preset(
        &self,
        name: &str,
        interface: &str,
        preset: Preset,
    ) -> Result<(), ProfileError> {
        let profiles = preset
            .profiles()
            .into_iter()
            .map(|profile| {
                profile.validate()?;
                Ok((format!("{name}-{}", profile.kind()), profile))
            })
            .collect::<Result<Vec<_>, ProfileError>>()
            .map_err(|e| {
                warn!(name, ?preset, %e, "Rejected preset");
                e
            })?;

        let mut inner = self.inner.write();
        if inner.scenarios.contains_key(name) {
            return Err(ProfileError::DuplicateName(name.to_string()));
        }
        if let Some((taken, _)) = profiles.iter().find(|(n, _)| inner.profiles.contains_key(n)) {
            return Err(ProfileError::DuplicateName(taken.clone()));
        }

        let scenario = profiles
            .iter()
            .fold(Scenario::new(name, interface), |s, (profile, _)| s.profile(profile));
        inner.profiles.extend(profiles);
        inner.scenarios.insert(name.to_string(), scenario);

        info!(name, interface, ?preset, "Added preset scenario");
        Ok(())
    }

    /// Adds the profile `profile` to the base of `scenario`.
    pub fn add_profile_to_scenario(
        &self,
        scenario: &str,
        profile: &str,
    ) -> Result<(), ProfileError> {
        let mut inner = self.inner.write();
        let value = inner.lookup(profile)?;
        let kind = value.kind();

        let current = inner
            .scenarios
            .get(scenario)
            .ok_or_else(|| ProfileError::UnknownScenario(scenario.to_string()))?;
        let clash = current
            .profiles()
            .iter()
            .any(|name| inner.profiles.get(name).is_some_and(|p| p.kind() == kind));
        if clash {
            return Err(ProfileError::DuplicateKind { scenario: scenario.to_string(), kind });
        }

        inner.scenario_mut(scenario)?.profiles_mut().push(profile.to_string());
        debug!(scenario, profile, "Added profile to scenario");
        Ok(())
    }

    /// Removes the profile `profile` from the base of `scenario`.
    pub fn remove_profile_from_scenario(
        &self,
        scenario: &str,
        profile: &str,
    ) -> Result<(), ProfileError> {
        let mut inner = self.inner.write();
        let profiles = inner.scenario_mut(scenario)?.profiles_mut();
        let idx = profiles
            .iter()
            .position(|p| p == profile)
            .ok_or_else(|| ProfileError::UnknownProfile(profile.to_string()))?;
        profiles.remove(idx);
        Ok(())
    }

    /// Adds a timed event to `scenario`.
    pub fn add_event(&self, scenario: &str, event: ScenarioEvent) -> Result<(), ProfileError> {
        event.validate()?;

        let mut inner = self.inner.write();
        inner.lookup(&event.profile)?;
        debug!(
            scenario,
            start_ms = event.start_ms,
            end_ms = event.end_ms,
            profile = %event.profile,
            "Added event"
        );
        inner.scenario_mut(scenario)?.events_mut().push(event);
        Ok(())
    }

    pub fn remove_scenario(&self, name: &str) -> Result<Scenario, ProfileError> {
        let scenario = self
            .inner
            .write()
            .scenarios
            .remove(name)
            .ok_or_else(|| ProfileError::UnknownScenario(name.to_string()))?;
        info!(name, "Removed scenario");
        Ok(scenario)
    }

    pub fn scenario(&self, name: &str) -> Option<Scenario> {
        self.inner.read().scenarios.get(name).cloned()
    }

    /// Scenario names, sorted.
    pub fn scenarios(&self) -> Vec<String> {
        self.inner.read().scenarios.keys().cloned().collect()
    }

    /// Looks up every profile `name` refers to.
    pub fn resolve_scenario(&self, name: &str) -> Result<ResolvedScenario, ProfileError> {
        let inner = self.inner.read();
        let scenario = inner
            .scenarios
            .get(name)
            .ok_or_else(|| ProfileError::UnknownScenario(name.to_string()))?;
        inner.check(scenario)
    }
}
