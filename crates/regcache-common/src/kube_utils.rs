//! Shared Kubernetes utilities using kube-rs
//!
//! Every object the reconciler manages goes through the same
//! read / mutate / merge-patch sequence. The sequence is written once here,
//! generic over the object type, on top of the [`ObjectStore`] seam so the
//! cluster can be replaced by a mock or an in-memory store in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{is_not_found, Operation};
use crate::{Error, FIELD_MANAGER};

// =============================================================================
// ObjectStore - the cluster's object store as seen by the reconciler
// =============================================================================

/// Trait abstracting the namespaced object operations the reconciler needs
///
/// Implementations return raw `kube::Error` so callers can attach the
/// identity of the object before surfacing it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, returning `None` when it does not exist
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error>;

    /// Create an object
    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Apply an RFC 7386 JSON merge patch to an existing object
    async fn merge_patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, kube::Error>;

    /// Delete an object (404 when it does not exist)
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str)
        -> Result<(), kube::Error>;
}

/// ObjectStore backed by a live API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        self.api(ar, namespace).get_opt(name).await
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(ar, namespace).create(&params, object).await
    }

    async fn merge_patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, kube::Error> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(ar, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error> {
        self.api(ar, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

// =============================================================================
// Get-and-create-or-merge-patch
// =============================================================================

/// What a create-or-patch or delete did to the stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    /// Object did not exist and was created
    Created,
    /// Object existed and a non-empty merge patch was applied
    Updated,
    /// Object already matched the desired state, no write was issued
    Unchanged,
    /// Object existed and was deleted
    Deleted,
    /// Object was already absent
    Absent,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
            OperationResult::Deleted => "deleted",
            OperationResult::Absent => "absent",
        };
        f.write_str(s)
    }
}

/// Fetch an object by identity, create it if missing, otherwise merge-patch it.
///
/// `object` carries the identity (name, namespace) and the initial state used
/// when the object does not exist yet. `mutate` sets only the fields the
/// caller owns. For an existing object the merge patch is computed between
/// the stored state and the mutated state, so fields the mutator leaves alone
/// (labels set by other actors, annotations, unknown fields) are never sent
/// and stay untouched. The patch carries the stored `resourceVersion`, so a
/// concurrent write makes it fail with 409 instead of being overwritten.
pub async fn get_and_create_or_merge_patch<K, F>(
    store: &dyn ObjectStore,
    object: K,
    mutate: F,
) -> Result<OperationResult, Error>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    F: FnOnce(&mut K),
{
    let ar = ApiResource::erase::<K>(&());
    let (namespace, name) = identity(&object, &ar)?;
    let codec_error =
        |e: serde_json::Error| Error::serialization(&ar.kind, &namespace, &name, e.to_string());

    let existing = store
        .get(&ar, &namespace, &name)
        .await
        .map_err(|e| Error::object(&ar.kind, &namespace, &name, Operation::Get, e))?;

    let Some(existing) = existing else {
        let mut desired = object;
        mutate(&mut desired);
        let dynamic = to_dynamic(&desired, &ar).map_err(codec_error)?;
        store
            .create(&ar, &namespace, &dynamic)
            .await
            .map_err(|e| Error::object(&ar.kind, &namespace, &name, Operation::Create, e))?;
        debug!(kind = %ar.kind, namespace = %namespace, name = %name, "created object");
        return Ok(OperationResult::Created);
    };

    let mut current: K = from_dynamic(existing, &ar).map_err(codec_error)?;
    let before = to_json(&current, &ar).map_err(codec_error)?;
    mutate(&mut current);
    let after = to_json(&current, &ar).map_err(codec_error)?;

    let mut patch = create_merge_patch(&before, &after);
    if is_empty_patch(&patch) {
        debug!(kind = %ar.kind, namespace = %namespace, name = %name, "object up to date");
        return Ok(OperationResult::Unchanged);
    }
    if let Some(rv) = current.meta().resource_version.clone() {
        set_resource_version(&mut patch, rv);
    }

    store
        .merge_patch(&ar, &namespace, &name, &patch)
        .await
        .map_err(|e| Error::object(&ar.kind, &namespace, &name, Operation::Patch, e))?;
    debug!(kind = %ar.kind, namespace = %namespace, name = %name, "patched object");
    Ok(OperationResult::Updated)
}

/// Delete an object by identity; an already absent object is not an error
pub async fn delete_object<K>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<OperationResult, Error>
where
    K: Resource<DynamicType = ()>,
{
    let ar = ApiResource::erase::<K>(&());
    match store.delete(&ar, namespace, name).await {
        Ok(()) => {
            info!(kind = %ar.kind, namespace = %namespace, name = %name, "deleted object");
            Ok(OperationResult::Deleted)
        }
        Err(e) if is_not_found(&e) => Ok(OperationResult::Absent),
        Err(e) => Err(Error::object(
            &ar.kind,
            namespace,
            name,
            Operation::Delete,
            e,
        )),
    }
}

/// Check whether an object exists; any failure other than 404 is surfaced
pub async fn object_exists<K>(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<bool, Error>
where
    K: Resource<DynamicType = ()>,
{
    let ar = ApiResource::erase::<K>(&());
    match store.get(&ar, namespace, name).await {
        Ok(found) => Ok(found.is_some()),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(Error::object(&ar.kind, namespace, name, Operation::Get, e)),
    }
}

/// Set a label on object metadata, creating the label map if needed
pub fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Compute an RFC 7386 JSON merge patch turning `original` into `modified`.
///
/// Keys equal on both sides are omitted, keys removed from `modified` are
/// set to `null`, nested objects are diffed recursively, and any other
/// change (scalars, arrays) replaces the value wholesale.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for (key, new_value) in modi {
                match orig.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        patch.insert(key.clone(), create_merge_patch(old_value, new_value));
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in orig.keys() {
                if !modi.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

fn set_resource_version(patch: &mut Value, resource_version: String) {
    if let Some(obj) = patch.as_object_mut() {
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(meta) = metadata.as_object_mut() {
            meta.insert("resourceVersion".to_string(), Value::String(resource_version));
        }
    }
}

fn identity<K: Resource>(object: &K, ar: &ApiResource) -> Result<(String, String), Error> {
    let meta = object.meta();
    let name = meta.name.clone().ok_or_else(|| {
        Error::internal_with_context("get_and_create_or_merge_patch", format!("{} has no name", ar.kind))
    })?;
    let namespace = meta.namespace.clone().ok_or_else(|| {
        Error::internal_with_context(
            "get_and_create_or_merge_patch",
            format!("{} {} has no namespace", ar.kind, name),
        )
    })?;
    Ok((namespace, name))
}

fn to_json<K: Serialize>(object: &K, ar: &ApiResource) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(object)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "apiVersion".to_string(),
            Value::String(ar.api_version.clone()),
        );
        obj.insert("kind".to_string(), Value::String(ar.kind.clone()));
    }
    Ok(value)
}

fn to_dynamic<K: Serialize>(object: &K, ar: &ApiResource) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(to_json(object, ar)?)
}

fn from_dynamic<K: DeserializeOwned>(
    object: DynamicObject,
    ar: &ApiResource,
) -> Result<K, serde_json::Error> {
    let mut value = serde_json::to_value(object)?;
    if let Some(obj) = value.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::String(ar.api_version.clone()));
        obj.entry("kind")
            .or_insert_with(|| Value::String(ar.kind.clone()));
    }
    serde_json::from_value(value)
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
