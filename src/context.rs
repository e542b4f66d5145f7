//! Values carried from step to step within a campaign.

use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClusterClient, ObjectHandle};
use crate::config::CampaignConfig;
use crate::error::{Error, Result};
use crate::manifest::{self, BundleSource, ManifestSet};
use crate::wait::WaitOptions;

/// Typed key into a [`Context`]
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

type Values = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// Immutable bag of campaign state handed to every step.
///
/// Deriving methods (`with_*`) return a new context and leave the receiver
/// untouched. The teardown registry is the one shared piece: every context
/// derived inside a feature registers into that feature's list.
#[derive(Clone)]
pub struct Context {
    client: Option<ClusterClient>,
    config: Arc<CampaignConfig>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: Arc<Values>,
    teardown: TeardownRegistry,
}

impl Context {
    pub fn new(
        client: Option<ClusterClient>,
        config: Arc<CampaignConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            cancel,
            deadline: None,
            values: Arc::new(HashMap::new()),
            teardown: TeardownRegistry::default(),
        }
    }

    /// Cluster client; absent in dry runs
    pub fn client(&self) -> Result<&ClusterClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::config("no cluster connection in this context"))
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn bundles(&self) -> BundleSource {
        BundleSource::new(self.config.template_dir.clone())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_value<T: Send + Sync + 'static>(&self, key: Key<T>, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.name, Arc::new(value));
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    pub fn value<T: Send + Sync + 'static>(&self, key: Key<T>) -> Option<Arc<T>> {
        self.values
            .get(key.name)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Like [`Context::value`] but a missing value is a configuration error
    pub fn require<T: Send + Sync + 'static>(&self, key: Key<T>) -> Result<Arc<T>> {
        self.value(key).ok_or_else(|| {
            Error::config(format!("'{}' has not been set by an earlier step", key.name))
        })
    }

    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Bound everything run with this context; an earlier deadline is kept
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub(crate) fn with_teardown(&self, teardown: TeardownRegistry) -> Self {
        Self {
            teardown,
            ..self.clone()
        }
    }

    /// Wait options bounded by both `timeout` and this context's deadline
    pub fn wait_options(&self, timeout: Duration) -> WaitOptions {
        let timeout = match self.deadline {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        };
        WaitOptions::new(self.cancel.clone()).with_timeout(timeout)
    }

    /// Queue an action for this feature's teardown; actions run last-in first-out
    pub async fn register_teardown(&self, action: TeardownAction) {
        self.teardown.push(action).await;
    }

    /// Register deletion of a created object
    pub async fn delete_on_teardown(&self, handle: ObjectHandle) {
        self.register_teardown(TeardownAction::Delete(handle)).await;
    }
}

/// Reverse action registered by a step that allocated something
pub enum TeardownAction {
    Delete(ObjectHandle),
    DeleteManifest(ManifestSet),
    Custom {
        name: String,
        run: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
    },
}

impl TeardownAction {
    pub fn custom<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        Self::Custom {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TeardownAction::Delete(handle) => format!("delete {handle}"),
            TeardownAction::DeleteManifest(set) => format!("delete manifest {}", set.name),
            TeardownAction::Custom { name, .. } => name.clone(),
        }
    }

    /// What the action would remove, one entry per object
    pub fn resources(&self) -> Vec<String> {
        match self {
            TeardownAction::Delete(handle) => vec![handle.to_string()],
            TeardownAction::DeleteManifest(set) => {
                set.handles().iter().map(ToString::to_string).collect()
            }
            TeardownAction::Custom { name, .. } => vec![name.clone()],
        }
    }

    async fn execute(self, client: Option<&ClusterClient>) -> Result<()> {
        match self {
            TeardownAction::Delete(handle) => {
                let client = client.ok_or_else(|| Error::config("no cluster connection"))?;
                client.delete_dynamic(&handle).await
            }
            TeardownAction::DeleteManifest(set) => {
                let client = client.ok_or_else(|| Error::config("no cluster connection"))?;
                manifest::delete(client, &set).await.map(|_| ())
            }
            TeardownAction::Custom { run, .. } => run().await,
        }
    }
}

/// Per-feature list of reverse actions
#[derive(Clone, Default)]
pub struct TeardownRegistry(Arc<Mutex<Vec<TeardownAction>>>);

impl TeardownRegistry {
    pub async fn push(&self, action: TeardownAction) {
        debug!("Registered teardown: {}", action.describe());
        self.0.lock().await.push(action);
    }

    pub async fn len(&self) -> usize {
        self.0.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.0.lock().await.is_empty()
    }

    /// Resources the registered actions would remove, in registration order
    pub async fn resources(&self) -> Vec<String> {
        self.0
            .lock()
            .await
            .iter()
            .flat_map(TeardownAction::resources)
            .collect()
    }

    /// Run every registered action in reverse registration order.
    ///
    /// NotFound counts as success. Failures are collected as teardown warnings
    /// and never stop the remaining actions.
    pub async fn drain(
        &self,
        client: Option<&ClusterClient>,
        cancel: &CancellationToken,
    ) -> Vec<Error> {
        let actions: Vec<TeardownAction> = std::mem::take(&mut *self.0.lock().await);
        let mut warnings = Vec::new();
        for action in actions.into_iter().rev() {
            let description = action.describe();
            if cancel.is_cancelled() {
                warnings.push(Error::teardown(format!("{description}: skipped after interrupt")));
                continue;
            }
            match action.execute(client).await {
                Ok(()) => debug!("Teardown: {}", description),
                Err(e) if e.is_not_found() => debug!("Teardown: {} (already gone)", description),
                Err(e) => {
                    warn!("Teardown step '{}' failed: {}", description, e);
                    warnings.push(Error::teardown(format!("{description}: {e}")));
                }
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    const NODE_TYPE: Key<String> = Key::new("node-type");
    const NODE_COUNT: Key<usize> = Key::new("node-count");

    fn context() -> Context {
        Context::new(
            None,
            Arc::new(CampaignConfig::default()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_values_are_typed_and_derivation_does_not_mutate() {
        let base = context();
        let derived = base.with_value(NODE_TYPE, "trn1.32xlarge".to_string());
        assert!(base.value(NODE_TYPE).is_none());
        assert_eq!(derived.value(NODE_TYPE).as_deref().map(String::as_str), Some("trn1.32xlarge"));
        assert!(derived.value(NODE_COUNT).is_none());

        let err = derived.require(NODE_COUNT).unwrap_err();
        assert_eq!(err.to_string(), "config error: 'node-count' has not been set by an earlier step");
    }

    #[test]
    fn test_client_absent_is_config_error() {
        let err = context().client().err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_options_capped_by_deadline() {
        let ctx = context().with_deadline(Instant::now() + Duration::from_secs(30));
        assert_eq!(ctx.wait_options(Duration::from_secs(600)).timeout, Duration::from_secs(30));
        assert_eq!(ctx.wait_options(Duration::from_secs(10)).timeout, Duration::from_secs(10));

        // a later deadline does not extend an earlier one
        let later = ctx.with_deadline(Instant::now() + Duration::from_secs(120));
        assert_eq!(later.deadline(), ctx.deadline());
    }

    #[tokio::test]
    async fn test_teardown_drains_in_reverse_and_swallows_not_found() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ctx = context();
        for name in ["namespace", "service", "pod"] {
            let order = order.clone();
            ctx.register_teardown(TeardownAction::custom(name, move || {
                async move {
                    order.lock().await.push(name);
                    if name == "service" {
                        Err(Error::not_found("Service", "default/pingpong-service"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            }))
            .await;
        }

        let warnings = ctx.teardown.drain(None, &CancellationToken::new()).await;
        assert!(warnings.is_empty());
        assert_eq!(*order.lock().await, vec!["pod", "service", "namespace"]);
        assert!(ctx.teardown.is_empty().await);
    }

    #[tokio::test]
    async fn test_teardown_failures_become_warnings() {
        let ctx = context();
        ctx.delete_on_teardown(ObjectHandle::new("v1", "Pod", Some("default"), "a"))
            .await;
        ctx.register_teardown(TeardownAction::custom("flaky", || {
            async { Err(Error::terminal("forbidden")) }.boxed()
        }))
        .await;

        let warnings = ctx.teardown.drain(None, &CancellationToken::new()).await;
        let messages: Vec<String> = warnings.iter().map(|w| w.to_string()).collect();
        assert_eq!(
            messages,
            vec![
                "teardown warning: flaky: terminal cluster error: forbidden",
                "teardown warning: delete Pod default/a: config error: no cluster connection",
            ]
        );
    }
}
