//! Typed access to Kubernetes resources
//!
//! Controllers read and write resources through [`ResourceStore`] rather than
//! `kube::Api` directly, so reconcile logic can run against an in-memory
//! store in tests.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::controller::status::OutcomeRecord;
use crate::error::{Error, Result};

/// Get, list and replace operations for one resource kind
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Fetch by key; `None` when the resource does not exist
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// Replace the whole object (metadata and spec)
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// List in one namespace, or cluster-wide for `None`
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;
}

/// Bounds shared by every kind the reconcile engine drives
pub trait Managed:
    Resource<DynamicType = ()>
    + OutcomeRecord
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = ()>
        + OutcomeRecord
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

type ApiFor<K> = fn(Client, Option<&str>) -> Api<K>;

/// [`ResourceStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    api_for: ApiFor<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Store for a cluster-scoped kind; the namespace argument is ignored
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: |client, _| Api::all(client),
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: |client, namespace| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        self.api(obj.namespace().as_deref())
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(Error::KubeError)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }
}
