//! Upcasting of stored event payloads to the current schema.
//!
//! Upcasters are registered per event type and source version when the
//! repository is built. Loading an aggregate runs every stored record through
//! the chain before the payload is decoded.
use std::collections::HashMap;

use serde_json::Value;

use crate::{Error, EventRecord, Result};

/// Transforms one event type's payload from one schema version to the next.
pub trait Upcaster: Send + Sync {
    /// The type of event this upcaster can handle.
    fn event_type(&self) -> &'static str;

    /// The version of the event this upcaster can transform from.
    fn source_version(&self) -> u16;

    /// The version of the event this upcaster transforms to. Must be higher
    /// than the source version.
    fn target_version(&self) -> u16 {
        self.source_version().saturating_add(1)
    }

    /// Transforms a JSON payload of an event into its next version.
    fn upcast(&self, payload: Value) -> Result<Value>;
}

/// A registry of upcasters keyed by event type and source version.
#[derive(Default)]
pub struct UpcasterChain {
    upcasters: HashMap<&'static str, HashMap<u16, Box<dyn Upcaster>>>,
}

impl std::fmt::Debug for UpcasterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.upcasters
                    .iter()
                    .map(|(event_type, versions)| (event_type, versions.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}

impl UpcasterChain {
    /// Creates a new, empty upcaster chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an upcaster, replacing any registered for the same event type and
    /// source version.
    pub fn with<U: Upcaster + 'static>(mut self, upcaster: U) -> Self {
        self.upcasters
            .entry(upcaster.event_type())
            .or_default()
            .insert(upcaster.source_version(), Box::new(upcaster));
        self
    }

    /// Returns whether no upcasters are registered.
    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    /// Upgrades a record until no upcaster applies to its version.
    ///
    /// An upcaster whose target version is not above its source version is
    /// a validation error.
    pub fn upcast(&self, mut record: EventRecord) -> Result<EventRecord> {
        let Some(versions) = self.upcasters.get(record.event_type.as_str()) else {
            return Ok(record);
        };
        while let Some(upcaster) = versions.get(&record.event_version) {
            let target = upcaster.target_version();
            if target <= record.event_version {
                return Err(Error::Validation(format!(
                    "upcaster for {} v{} targets v{target}",
                    record.event_type, record.event_version
                )));
            }
            record.body = upcaster.upcast(record.body)?;
            record.event_version = target;
        }
        Ok(record)
    }
}
