//! Test doubles for the [`ObjectStore`] seam
//!
//! [`InMemoryStore`] keeps objects as JSON and applies real RFC 7386 merge
//! semantics, resourceVersion preconditions and 404/409 responses, so
//! idempotence and field-preservation properties can be checked without an
//! API server. Failure injection is done with `MockObjectStore`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::kube_utils::ObjectStore;

pub use crate::kube_utils::MockObjectStore;

type Key = (String, String, String, String);

/// Build a kube API error response with the given HTTP code
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (injected)"),
        reason: reason.to_string(),
        code,
    })
}

/// In-memory object store with API-server-like write semantics
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    resource_version: AtomicU64,
    writes: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing write accounting
    pub fn insert<K>(&self, object: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let ar = ApiResource::erase::<K>(&());
        let meta = object.meta();
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();

        let mut value = serde_json::to_value(object).expect("test object should serialize");
        value["apiVersion"] = Value::String(ar.api_version.clone());
        value["kind"] = Value::String(ar.kind.clone());
        self.stamp(&mut value);
        self.lock()
            .insert(key(&ar, &namespace, &name), value);
    }

    /// Seed raw JSON as an object of type `K`, for contents `K` cannot represent
    pub fn insert_json<K>(&self, namespace: &str, name: &str, mut value: Value)
    where
        K: Resource<DynamicType = ()>,
    {
        let ar = ApiResource::erase::<K>(&());
        value["apiVersion"] = Value::String(ar.api_version.clone());
        value["kind"] = Value::String(ar.kind.clone());
        value["metadata"]["name"] = Value::String(name.to_string());
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        self.stamp(&mut value);
        self.lock().insert(key(&ar, namespace, name), value);
    }

    /// Read an object back as a typed resource
    pub fn get_typed<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let ar = ApiResource::erase::<K>(&());
        self.lock()
            .get(&key(&ar, namespace, name))
            .map(|v| serde_json::from_value(v.clone()).expect("stored object should deserialize"))
    }

    /// Check whether an object of type `K` exists
    pub fn contains<K>(&self, namespace: &str, name: &str) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        let ar = ApiResource::erase::<K>(&());
        self.lock().contains_key(&key(&ar, namespace, name))
    }

    /// Raw JSON of every stored object, ordered by (apiVersion, kind, namespace, name)
    pub fn snapshot(&self) -> Vec<Value> {
        self.lock().values().cloned().collect()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of successful create, patch and delete calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, Value>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stamp(&self, value: &mut Value) {
        let rv = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        value["metadata"]["resourceVersion"] = Value::String(rv.to_string());
    }
}

fn key(ar: &ApiResource, namespace: &str, name: &str) -> Key {
    (
        ar.api_version.clone(),
        ar.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn to_dynamic(value: &Value) -> Result<DynamicObject, kube::Error> {
    serde_json::from_value(value.clone()).map_err(kube::Error::SerdeError)
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        self.lock()
            .get(&key(ar, namespace, name))
            .map(to_dynamic)
            .transpose()
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let k = key(ar, namespace, &name);
        let mut objects = self.lock();
        if objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }

        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        self.stamp(&mut value);
        let created = to_dynamic(&value)?;
        objects.insert(k, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn merge_patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject, kube::Error> {
        let mut objects = self.lock();
        let Some(stored) = objects.get_mut(&key(ar, namespace, name)) else {
            return Err(api_error(404, "NotFound"));
        };

        if let Some(expected) = patch.pointer("/metadata/resourceVersion") {
            if stored.pointer("/metadata/resourceVersion") != Some(expected) {
                return Err(api_error(409, "Conflict"));
            }
        }

        json_patch::merge(stored, patch);
        self.stamp(stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        to_dynamic(stored)
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error> {
        match self.lock().remove(&key(ar, namespace, name)) {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(api_error(404, "NotFound")),
        }
    }
}
