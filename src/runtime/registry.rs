//! Versioned registries for orchestrations and activities.
//!
//! A single `Registry<H>` stores both kinds of handler. Activities are always
//! registered at version 1.0.0; orchestrations may carry explicit semver
//! versions and a per-name [`VersionPolicy`] that picks the version new
//! instances start on.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use semver::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{OrchestrationContext, codec};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

type VersionMap<H> = HashMap<String, BTreeMap<Version, Arc<H>>>;

pub struct Registry<H: ?Sized> {
    inner: Arc<VersionMap<H>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// H: ?Sized rules out the derive
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: VersionMap<H>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<String, VersionPolicy>> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the handler new instances of `name` should run, following its version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self.policies().get(name).cloned().unwrap_or(VersionPolicy::Latest);

        let result = match &pol {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };

        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }
        result
    }

    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    /// Resolve the handler for an execution that recorded `version` in its history.
    ///
    /// Unversioned or unparsable versions fall back to the name's policy.
    pub fn resolve_for_execution(&self, name: &str, version: Option<&str>) -> Option<(Version, Arc<H>)> {
        match version.and_then(|v| Version::parse(v).ok()) {
            Some(v) => self.resolve_handler_exact(name, &v).map(|h| (v, h)),
            None => self.resolve_handler(name),
        }
    }

    pub fn resolve_version(&self, name: &str) -> Option<Version> {
        self.resolve_handler(name).map(|(v, _h)| v)
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policies().insert(name.to_string(), policy);
    }

    fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.inner.keys().collect::<Vec<_>>(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build the registry. Registration errors are logged and the offending entries skipped.
    pub fn build(self) -> Registry<H> {
        for error in &self.errors {
            tracing::warn!(error = %error, "registration rejected");
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the registry, failing if any registration was rejected.
    ///
    /// # Errors
    ///
    /// Returns every registration error joined with `"; "`.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    /// Record an error and return false when `name@version` cannot be inserted.
    fn admit(&mut self, name: &str, version: &Version, error_prefix: &str, monotonic: bool) -> bool {
        let entry = self.map.entry(name.to_string()).or_default();
        if entry.contains_key(version) {
            self.errors.push(format!("duplicate {error_prefix} registration: {name}@{version}"));
            return false;
        }
        if monotonic {
            if let Some((latest, _)) = entry.iter().next_back() {
                if version <= latest {
                    self.errors.push(format!(
                        "non-monotonic {error_prefix} version for {name}: {version} is not later than {latest}"
                    ));
                    return false;
                }
            }
        }
        true
    }

    fn parse_version(&mut self, name: &str, version: &str) -> Option<Version> {
        match Version::parse(version) {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(format!("invalid version '{version}' for {name}: {e}"));
                None
            }
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)))
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        self.register(name, typed_orchestration(f))
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let name = name.into();
        match self.parse_version(&name, version.as_ref()) {
            Some(v) => self.insert(name, v, Arc::new(FnOrchestration(f))),
            None => self,
        }
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        self.register_versioned(name, version, typed_orchestration(f))
    }

    fn insert(mut self, name: String, version: Version, handler: Arc<dyn OrchestrationHandler>) -> Self {
        if self.admit(&name, &version, "orchestration", true) {
            self.map.entry(name).or_default().insert(version, handler);
        }
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let name = name.into();
        if self.admit(&name, &DEFAULT_VERSION, "activity", false) {
            self.map
                .entry(name)
                .or_default()
                .insert(DEFAULT_VERSION, Arc::new(FnActivity(f)));
        }
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: ActivityContext, input: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = codec::decode(&input)?;
                let out = f(ctx, input).await?;
                codec::encode(&out)
            }
        })
    }
}

impl ActivityRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.resolve_handler(name).map(|(_, h)| h)
    }
}

fn typed_orchestration<In, Out, F, Fut>(
    f: F,
) -> impl Fn(OrchestrationContext, String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync + 'static
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
{
    let f = Arc::new(f);
    move |ctx: OrchestrationContext, input: String| {
        let f = Arc::clone(&f);
        async move {
            let input: In = codec::decode(&input)?;
            let out = f(ctx, input).await?;
            codec::encode(&out)
        }
        .boxed()
    }
}
