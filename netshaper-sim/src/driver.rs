use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{effective::ImpairmentDescription, DriverError};

/// Receives the effective impairment of an interface whenever it changes.
///
/// This is the seam between the in-memory engine and whatever enforces impairments on a real
/// interface (for instance a component rendering
/// [`netem_args`](ImpairmentDescription::netem_args) into `tc` invocations).
pub trait ImpairmentDriver: Send + 'static {
    /// Installs `description` on `interface`, replacing whatever was there.
    fn apply(
        &mut self,
        interface: &str,
        description: &ImpairmentDescription,
    ) -> Result<(), DriverError>;

    /// Removes every impairment from `interface`.
    fn clear(&mut self, interface: &str) -> Result<(), DriverError>;
}

impl<D: ImpairmentDriver + ?Sized> ImpairmentDriver for Box<D> {
    fn apply(
        &mut self,
        interface: &str,
        description: &ImpairmentDescription,
    ) -> Result<(), DriverError> {
        (**self).apply(interface, description)
    }

    fn clear(&mut self, interface: &str) -> Result<(), DriverError> {
        (**self).clear(interface)
    }
}

/// Accepts everything and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDriver;

impl ImpairmentDriver for NoopDriver {
    fn apply(
        &mut self,
        interface: &str,
        description: &ImpairmentDescription,
    ) -> Result<(), DriverError> {
        debug!(interface, args = ?description.netem_args(), "Noop driver apply");
        Ok(())
    }

    fn clear(&mut self, _interface: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

/// A call received by a [`RecordingDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Apply { interface: String, description: ImpairmentDescription },
    Clear { interface: String },
}

/// Keeps an in-memory log of every call. Clones share the log, so a test can keep one handle
/// and give the other to a simulator.
#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    calls: Arc<Mutex<Vec<DriverCall>>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the log.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    /// The last description applied to `interface`, unless it was cleared since.
    pub fn current(&self, interface: &str) -> Option<ImpairmentDescription> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            DriverCall::Apply { interface: i, description } if i == interface => {
                Some(Some(description.clone()))
            }
            DriverCall::Clear { interface: i } if i == interface => Some(None),
            _ => None,
        })?
    }
}

impl ImpairmentDriver for RecordingDriver {
    fn apply(
        &mut self,
        interface: &str,
        description: &ImpairmentDescription,
    ) -> Result<(), DriverError> {
        self.calls.lock().push(DriverCall::Apply {
            interface: interface.to_string(),
            description: description.clone(),
        });
        Ok(())
    }

    fn clear(&mut self, interface: &str) -> Result<(), DriverError> {
        self.calls.lock().push(DriverCall::Clear { interface: interface.to_string() });
        Ok(())
    }
}
