//! Scheduler plugins.
//!
//! Each plugin registers extension closures on the session when it opens;
//! the actions only ever see the typed slices, never the plugins
//! themselves. Construction goes through a registration table mapping
//! plugin name to factory, so there is no dynamic lookup on hot paths.

use std::collections::BTreeMap;

use crate::fit_error::SchedulerError;
use crate::session::Session;

pub mod dynamicresources;
pub mod elastic;
pub mod gpupack;
pub mod gpuspread;
pub mod gpusharingorder;
pub mod minruntime;
pub mod nodeavailability;
pub mod nodeplacement;
pub mod nominatednode;
pub mod podaffinity;
pub mod predicates;
pub mod priority;
pub mod proportion;
pub mod requeue;
pub mod resourcetype;
pub mod snapshot_plugin;
pub mod subgrouporder;
pub mod taskorder;
pub mod topology;

pub type PluginArguments = BTreeMap<String, serde_yaml::Value>;
pub type PluginFactory = fn(&PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError>;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn on_session_open(&mut self, session: &mut Session);
    fn on_session_close(&mut self, _session: &mut Session) {}
}

/// Name -> constructor table. Lookup happens once per session open;
/// unknown names fail the session. When two entries would share a spot the
/// order is deterministic: BTreeMap iteration is lexicographic by name.
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("dynamicresources", dynamicresources::factory);
        registry.register("elastic", elastic::factory);
        registry.register("gpupack", gpupack::factory);
        registry.register("gpuspread", gpuspread::factory);
        registry.register("gpusharingorder", gpusharingorder::factory);
        registry.register("minruntime", minruntime::factory);
        registry.register("nodeavailability", nodeavailability::factory);
        registry.register("nodeplacement", nodeplacement::factory);
        registry.register("nominatednode", nominatednode::factory);
        registry.register("podaffinity", podaffinity::factory);
        registry.register("predicates", predicates::factory);
        registry.register("priority", priority::factory);
        registry.register("proportion", proportion::factory);
        registry.register("requeue", requeue::factory);
        registry.register("resourcetype", resourcetype::factory);
        registry.register("snapshot", snapshot_plugin::factory);
        registry.register("subgrouporder", subgrouporder::factory);
        registry.register("taskorder", taskorder::factory);
        registry.register("topology", topology::factory);
        registry
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn build(
        &self,
        name: &str,
        arguments: &PluginArguments,
    ) -> Result<Box<dyn Plugin>, SchedulerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownPlugin(name.to_string()))?;
        factory(arguments)
    }
}

/// Reads a float argument, failing the session open on a malformed value.
pub(crate) fn float_argument(
    arguments: &PluginArguments,
    key: &str,
) -> Result<Option<f64>, SchedulerError> {
    match arguments.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .or_else(|| value.as_i64().map(|v| v as f64))
            .map(Some)
            .ok_or_else(|| SchedulerError::Config(format!("argument {key} must be a number"))),
    }
}

pub(crate) fn bool_argument(
    arguments: &PluginArguments,
    key: &str,
) -> Result<Option<bool>, SchedulerError> {
    match arguments.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| SchedulerError::Config(format!("argument {key} must be a boolean"))),
    }
}

pub(crate) fn string_argument(arguments: &PluginArguments, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_plugin_is_fatal() {
        let registry = PluginRegistry::builtin();
        match registry.build("doesnotexist", &BTreeMap::new()) {
            Ok(_) => panic!("expected unknown plugin error"),
            Err(err) => assert!(matches!(err, SchedulerError::UnknownPlugin(_))),
        }
    }

    #[test]
    fn test_builtin_names_resolve() {
        let registry = PluginRegistry::builtin();
        for name in [
            "priority",
            "elastic",
            "proportion",
            "predicates",
            "topology",
            "requeue",
        ] {
            assert!(registry.build(name, &BTreeMap::new()).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_malformed_argument_fails_open() {
        let mut arguments = PluginArguments::new();
        arguments.insert("k".to_string(), serde_yaml::Value::String("high".into()));
        assert!(float_argument(&arguments, "k").is_err());
    }
}
