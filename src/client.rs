//! Typed and schemaless access to the Kubernetes API.

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, GetParams, ListParams, LogParams, Patch,
    PatchParams, PostParams, PropagationPolicy,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::Scope;
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schemaless::{build_api_resource, is_cluster_scoped_kind, parse_api_version};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "argus";

/// Exit code of a process terminated by SIGTERM (128 + 15)
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// Identity of a cluster object, independent of its payload type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectHandle {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Handle of a typed object
    pub fn of<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }

    /// Handle of a typed kind by name
    pub fn named<K>(namespace: Option<&str>, name: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(K::api_version(&()), K::kind(&()), namespace, name)
    }

    /// Handle of a schemaless object
    pub fn of_dynamic(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.name_any(),
        })
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind::gvk(&group, &version, &self.kind)
    }
}

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Captured output of a command run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the API server did not report a status
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn terminated_by_sigterm(&self) -> bool {
        self.exit_code == Some(SIGTERM_EXIT_CODE)
    }
}

/// Extract the remote exit code from the status frame of an exec session
pub fn exit_code_from_status(status: Option<&Status>) -> Option<i32> {
    let status = status?;
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref()?.trim().parse().ok())
}

/// Resolved API resource and whether it is namespaced
type ResolvedResource = (ApiResource, bool);

/// Cluster client facade shared by every step of a campaign
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    resources: Arc<Mutex<HashMap<String, ResolvedResource>>>,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve a REST config and build a client
    ///
    /// An explicit kubeconfig path wins; otherwise the usual inference applies
    /// (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let mut config = match kubeconfig {
            Some(path) => {
                info!("Loading kubeconfig from {}", path.display());
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::config(format!("failed to read kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::config(format!("invalid kubeconfig: {e}")))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::config(format!("failed to infer kube config: {e}")))?,
        };

        if let Ok(proxy) = std::env::var("HTTPS_PROXY") {
            // the underlying HTTP client picks the proxy up from the environment
            info!("Using proxy: {}", proxy);
        }

        if std::env::var("KUBE_INSECURE_TLS").is_ok()
            || std::env::var("KUBERNETES_INSECURE_TLS").is_ok()
        {
            info!("Disabling TLS certificate verification due to environment variable");
            config.accept_invalid_certs = true;
        }

        Ok(Self::new(Client::try_from(config)?))
    }

    pub fn raw(&self) -> &Client {
        &self.client
    }

    pub fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn cluster<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        self.namespaced(namespace)
    }

    /// Get an object, mapping a missing object to [`Error::NotFound`]
    pub async fn get<K>(&self, api: &Api<K>, name: &str) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        self.get_opt(api, name)
            .await?
            .ok_or_else(|| Error::not_found(K::kind(&()), name))
    }

    pub async fn get_opt<K>(&self, api: &Api<K>, name: &str) -> Result<Option<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        Ok(api.get_opt(name).await?)
    }

    pub async fn list<K>(&self, api: &Api<K>, params: &ListParams) -> Result<Vec<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        Ok(api.list(params).await?.items)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = self.cluster();
        self.list(&nodes, &ListParams::default()).await
    }

    /// Create an object; an existing object fails with AlreadyExists
    pub async fn create<K>(&self, api: &Api<K>, obj: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        debug!("Creating {}", obj.name_any());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    pub async fn replace<K>(&self, api: &Api<K>, obj: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        Ok(api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    /// Delete an object with background propagation; a missing object is an error
    pub async fn delete<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        api.delete(name, &background_delete()).await?;
        Ok(())
    }

    /// Delete an object, treating NotFound as success; returns whether anything was deleted
    pub async fn delete_if_exists<K>(&self, api: &Api<K>, name: &str) -> Result<bool>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        match self.delete(api, name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolve apiVersion/kind through discovery, caching the answer
    pub async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedResource> {
        let key = format!("{api_version}/{kind}");
        if let Some(hit) = self.resources.lock().await.get(&key) {
            return Ok(hit.clone());
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        let resolved = match kube::discovery::pinned_kind(&self.client, &gvk).await {
            Ok((resource, caps)) => (resource, matches!(caps.scope, Scope::Namespaced)),
            Err(e) => {
                // CRDs applied earlier in the same manifest may not be discoverable yet
                debug!("Discovery failed for {key}, deriving resource locally: {e}");
                (
                    build_api_resource(api_version, kind),
                    !is_cluster_scoped_kind(kind),
                )
            }
        };

        self.resources
            .lock()
            .await
            .insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Schemaless API for the object a handle names
    pub async fn dynamic_api(&self, handle: &ObjectHandle) -> Result<Api<DynamicObject>> {
        let (resource, namespaced) = self.resolve(&handle.api_version, &handle.kind).await?;
        Ok(if namespaced {
            let namespace = handle.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        })
    }

    pub async fn get_dynamic(&self, handle: &ObjectHandle) -> Result<Option<DynamicObject>> {
        let api = self.dynamic_api(handle).await?;
        Ok(api.get_opt(&handle.name).await?)
    }

    pub async fn create_dynamic(
        &self,
        handle: &ObjectHandle,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(handle).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    /// Server-side apply of a schemaless document
    pub async fn apply_dynamic(
        &self,
        handle: &ObjectHandle,
        document: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(handle).await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(api
            .patch(&handle.name, &params, &Patch::Apply(document))
            .await?)
    }

    /// Delete the object a handle names; NotFound is reported as an error
    pub async fn delete_dynamic(&self, handle: &ObjectHandle) -> Result<()> {
        let api = self.dynamic_api(handle).await?;
        api.delete(&handle.name, &background_delete()).await?;
        Ok(())
    }

    /// Run a command in a container and wait for it to exit
    pub async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        use tokio::io::AsyncReadExt;

        debug!("Exec in {namespace}/{pod}[{container}]: {}", command.join(" "));
        let pods = self.pods(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = pods.exec(pod, command, &params).await?;

        let status = attached.take_status();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let read_stdout = async {
            if let Some(mut reader) = stdout_reader {
                reader.read_to_end(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stderr = async {
            if let Some(mut reader) = stderr_reader {
                reader.read_to_end(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::try_join!(read_stdout, read_stderr)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::transient(format!("exec session in {pod} ended abnormally: {e}")))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code: exit_code_from_status(status.as_ref()),
        })
    }

    /// Full logs of one container
    pub async fn logs(&self, namespace: &str, pod: &str, container: Option<&str>) -> Result<String> {
        let params = LogParams {
            container: container.map(str::to_string),
            ..Default::default()
        };
        Ok(self.pods(namespace).logs(pod, &params).await?)
    }

    /// GET the kubelet health endpoint through the API server node proxy
    pub async fn node_healthz(&self, node: &str) -> Result<String> {
        let request = kube::core::Request::new(format!("/api/v1/nodes/{node}/proxy"))
            .get("healthz", &GetParams::default())
            .map_err(|e| Error::config(format!("failed to build healthz request: {e}")))?;
        Ok(self.client.request_text(request).await?)
    }
}

fn background_delete() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, StatusCause, StatusDetails};

    #[test]
    fn test_handle_of_typed_object() {
        let job = Job {
            metadata: ObjectMeta {
                name: Some("job-pi".to_string()),
                namespace: Some("argus-jobs".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let handle = ObjectHandle::of(&job);
        assert_eq!(handle.api_version, "batch/v1");
        assert_eq!(handle.kind, "Job");
        assert_eq!(handle.to_string(), "Job argus-jobs/job-pi");
        assert_eq!(handle, ObjectHandle::named::<Job>(Some("argus-jobs"), "job-pi"));
    }

    #[test]
    fn test_handle_gvk() {
        let handle = ObjectHandle::new("kubeflow.org/v2beta1", "MPIJob", Some("default"), "x");
        let gvk = handle.gvk();
        assert_eq!(gvk.group, "kubeflow.org");
        assert_eq!(gvk.version, "v2beta1");
        assert_eq!(gvk.kind, "MPIJob");
    }

    fn exit_status(code: &str) -> Status {
        Status {
            status: Some("Failure".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some(code.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_code_from_status() {
        let success = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&success)), Some(0));
        assert_eq!(exit_code_from_status(Some(&exit_status("143"))), Some(143));
        assert_eq!(exit_code_from_status(None), None);
    }

    #[test]
    fn test_sigterm_is_distinguishable() {
        let output = ExecOutput {
            exit_code: exit_code_from_status(Some(&exit_status("143"))),
            ..Default::default()
        };
        assert!(output.terminated_by_sigterm());
        assert!(!output.succeeded());

        let killed = ExecOutput {
            exit_code: Some(137),
            ..Default::default()
        };
        assert!(!killed.terminated_by_sigterm());
    }
}
