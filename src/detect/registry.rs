use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::FlowKind;

use super::engine::{FaceEngine, SharedEngine};

type EngineFactory = Box<dyn Fn() -> SharedEngine + Send + Sync>;

struct EngineEntry {
    /// Flows the engine reported support for when it was registered.
    flows: Vec<FlowKind>,
    build: EngineFactory,
}

/// Registry of face engine constructors.
///
/// Every `engine_for` call builds a fresh instance, so two flows never share
/// liveness progress or motion state. Supported flows are read once at
/// registration from a probe instance.
#[derive(Default)]
pub struct EngineRegistry {
    entries: BTreeMap<String, EngineEntry>,
    default_name: Option<String>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine constructor. The first registered engine becomes
    /// the default; registering a name twice replaces the earlier entry.
    pub fn register<E, F>(&mut self, factory: F)
    where
        E: FaceEngine + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        let probe = factory();
        let name = probe.name().to_string();
        let flows: Vec<FlowKind> = FlowKind::ALL
            .into_iter()
            .filter(|kind| probe.supports(*kind))
            .collect();
        if flows.is_empty() {
            log::warn!("engine '{}' supports no flows and will never be selected", name);
        }
        log::debug!("registered engine '{}' for {:?}", name, flows);
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.entries.insert(
            name,
            EngineEntry {
                flows,
                build: Box::new(move || -> SharedEngine { Arc::new(Mutex::new(factory())) }),
            },
        );
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.entries.contains_key(name) {
            return Err(anyhow!(
                "engine '{}' not registered (known: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Registered engine names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn supported_flows(&self, name: &str) -> Option<&[FlowKind]> {
        self.entries.get(name).map(|entry| entry.flows.as_slice())
    }

    /// Build a new engine for `kind`: the default if it supports the flow,
    /// otherwise the first supporting engine by name.
    pub fn engine_for(&self, kind: FlowKind) -> Result<SharedEngine> {
        let preferred = self
            .default_name
            .as_deref()
            .and_then(|name| self.entries.get_key_value(name));
        let chosen = preferred
            .filter(|(_, entry)| entry.flows.contains(&kind))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(_, entry)| entry.flows.contains(&kind))
            });
        match chosen {
            Some((name, entry)) => {
                log::debug!("{:?} flow uses engine '{}'", kind, name);
                Ok((entry.build)())
            }
            None => Err(anyhow!("no registered engine supports {:?} flows", kind)),
        }
    }
}
