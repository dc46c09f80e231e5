//! Immutable workflow context threaded through every task.
//!
//! The context has three parts:
//! - `config`: frozen configuration, set once when the context is built
//! - `data`: accumulated results, copy-on-write on each [`fork`](WorkflowContext::fork)
//! - `services`: injected collaborators, shared by reference and never mutated
//!
//! Each part lives behind an `Arc`, so cloning a context is cheap and a
//! fork only copies the data map.

use crate::workflow::task::TaskError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-keyed bundle of collaborator services.
///
/// The engine never looks inside; tasks fetch what they need by type.
///
/// # Example
///
/// ```ignore
/// let services = Services::new().with(GitClient::new(repo_path));
/// let git = context.services().require::<GitClient>()?;
/// ```
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    /// Creates an empty service bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service, replacing any previous service of the same type.
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    /// Adds an already shared service.
    pub fn with_arc<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.entries.insert(TypeId::of::<T>(), service);
        self
    }

    /// Returns the service of type `T`, if present.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|service| Arc::clone(service).downcast::<T>().ok())
    }

    /// Returns the service of type `T` or a [`TaskError::MissingService`].
    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>, TaskError> {
        self.get::<T>()
            .ok_or(TaskError::MissingService(type_name::<T>()))
    }

    /// Returns true if a service of type `T` is present.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Returns the number of services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no service is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Immutable carrier of configuration, accumulated data and services.
#[derive(Clone)]
pub struct WorkflowContext {
    config: Arc<Value>,
    data: Arc<Map<String, Value>>,
    services: Arc<Services>,
    execution_id: Arc<str>,
    dry_run: bool,
}

impl WorkflowContext {
    /// Creates a context with the given frozen configuration.
    pub fn new(config: Value) -> Self {
        Self {
            config: Arc::new(config),
            data: Arc::new(Map::new()),
            services: Arc::new(Services::new()),
            execution_id: Arc::from(""),
            dry_run: false,
        }
    }

    /// Sets the service bundle.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = Arc::new(services);
        self
    }

    /// Seeds the data map.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Arc::new(data);
        self
    }

    /// Stamps run metadata onto the context when a run starts.
    pub(crate) fn for_run(mut self, execution_id: &str, dry_run: bool) -> Self {
        self.execution_id = Arc::from(execution_id);
        self.dry_run = dry_run;
        self
    }

    /// Returns a context with `key` set to `value`.
    ///
    /// Config and services are shared with `self`. If `key` already holds
    /// an equal value, the returned context shares every part with `self`
    /// (see [`ptr_eq`](Self::ptr_eq)).
    pub fn fork(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();

        if self.data.get(&key) == Some(&value) {
            return self.clone();
        }

        let mut data = (*self.data).clone();
        data.insert(key, value);

        Self {
            config: Arc::clone(&self.config),
            data: Arc::new(data),
            services: Arc::clone(&self.services),
            execution_id: Arc::clone(&self.execution_id),
            dry_run: self.dry_run,
        }
    }

    /// Forks with a serializable value.
    pub fn fork_serialized<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, TaskError> {
        Ok(self.fork(key, serde_json::to_value(value)?))
    }

    /// Returns true if both contexts share config, data and services.
    pub fn ptr_eq(&self, other: &WorkflowContext) -> bool {
        Arc::ptr_eq(&self.config, &other.config)
            && Arc::ptr_eq(&self.data, &other.data)
            && Arc::ptr_eq(&self.services, &other.services)
    }

    /// Returns a data value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Decodes a data value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TaskError> {
        match self.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Returns the read-only data snapshot.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Returns the frozen configuration.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Looks up a configuration value by JSON pointer (`/git/push`).
    pub fn config_value(&self, pointer: &str) -> Option<&Value> {
        self.config.pointer(pointer)
    }

    /// Returns the injected services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Returns the execution id of the current run (empty outside a run).
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Returns true when the run is a dry run.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("execution_id", &self.execution_id)
            .field("dry_run", &self.dry_run)
            .field("config", &self.config)
            .field("data", &self.data)
            .field("services", &self.services)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct GitClient {
        remote: String,
    }

    #[test]
    fn test_fork_adds_value() {
        let base = WorkflowContext::default();
        let next = base.fork("version", "1.0.0");

        assert!(base.get("version").is_none());
        assert_eq!(next.get("version"), Some(&json!("1.0.0")));
        assert!(!base.ptr_eq(&next));
    }

    #[test]
    fn test_fork_unchanged_value_returns_same_context() {
        let base = WorkflowContext::default().fork("k", 1);
        let same = base.fork("k", 1);

        assert!(base.ptr_eq(&same));
    }

    #[test]
    fn test_fork_shares_config_and_services() {
        let base = WorkflowContext::new(json!({"git": {"push": true}}))
            .with_services(Services::new().with(GitClient { remote: "origin".into() }));
        let next = base.fork("tagged", true);

        assert!(Arc::ptr_eq(&base.config, &next.config));
        assert!(Arc::ptr_eq(&base.services, &next.services));
        assert_eq!(next.config_value("/git/push"), Some(&json!(true)));
    }

    #[test]
    fn test_services_lookup() {
        let services = Services::new().with(GitClient { remote: "origin".into() });

        assert!(services.contains::<GitClient>());
        assert_eq!(services.get::<GitClient>().unwrap().remote, "origin");
        assert!(services.get::<String>().is_none());
        assert!(matches!(
            services.require::<String>(),
            Err(TaskError::MissingService(_))
        ));
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn test_get_as_decodes_values() {
        #[derive(Debug, Deserialize, Serialize, PartialEq)]
        struct Bump {
            from: String,
            to: String,
        }

        let bump = Bump { from: "1.0.0".into(), to: "1.1.0".into() };
        let context = WorkflowContext::default()
            .fork_serialized("bump", &bump)
            .unwrap();

        assert_eq!(context.get_as::<Bump>("bump").unwrap(), Some(bump));
        assert_eq!(context.get_as::<Bump>("missing").unwrap(), None);
        assert!(context.get_as::<u32>("bump").is_err());
    }

    #[test]
    fn test_run_metadata_survives_fork() {
        let context = WorkflowContext::default().for_run("release-1", true);
        let next = context.fork("a", 1);

        assert_eq!(next.execution_id(), "release-1");
        assert!(next.is_dry_run());
    }
}
