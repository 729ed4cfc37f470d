//! Remote object store for the network-management backend
//!
//! The controllers never talk HTTP directly. They build [`RemoteObject`]s and
//! hand them to a [`RemoteStore`], which is shared read-mostly between all
//! reconcile workers and the garbage collectors.
//!
//! Every object the operator creates carries correlation tags linking it back
//! to the resource it realizes. Those tags are what the garbage collectors
//! use to find orphans.

pub mod rest;

#[cfg(test)]
pub(crate) mod memory;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Tag scope recording the cluster that owns an object
pub const TAG_SCOPE_CLUSTER: &str = "netsync/cluster";
/// Tag scope recording the controller (resource type) that owns an object
pub const TAG_SCOPE_RES_TYPE: &str = "netsync/res-type";
/// Tag scope carrying the uid of the originating resource
pub const TAG_SCOPE_UID: &str = "netsync/uid";
/// Tag scope carrying the namespace of the originating resource
pub const TAG_SCOPE_NAMESPACE: &str = "netsync/namespace";
/// Tag scope carrying the name of the originating resource
pub const TAG_SCOPE_NAME: &str = "netsync/name";

/// Kinds of backend objects managed by the operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RemoteKind {
    SecurityPolicy,
    Group,
    Vpc,
    IpBlock,
    IpAddressAllocation,
    AddressBinding,
}

impl RemoteKind {
    /// `resource_type` used by the backend search API
    pub fn resource_type(&self) -> &'static str {
        match self {
            RemoteKind::SecurityPolicy => "SecurityPolicy",
            RemoteKind::Group => "Group",
            RemoteKind::Vpc => "Vpc",
            RemoteKind::IpBlock => "IpAddressBlock",
            RemoteKind::IpAddressAllocation => "VpcIpAddressAllocation",
            RemoteKind::AddressBinding => "AddressBinding",
        }
    }

    /// Teardown position: objects that reference others go first.
    ///
    /// A policy references its groups and a VPC references its IP blocks, and
    /// the backend refuses to delete anything still referenced.
    pub fn teardown_rank(&self) -> u8 {
        match self {
            RemoteKind::SecurityPolicy
            | RemoteKind::Vpc
            | RemoteKind::IpAddressAllocation
            | RemoteKind::AddressBinding => 0,
            RemoteKind::Group | RemoteKind::IpBlock => 1,
        }
    }
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_type())
    }
}

/// Key/value tag attached to a backend object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub scope: String,
    pub tag: String,
}

impl Tag {
    pub fn new(scope: &str, tag: impl Into<String>) -> Self {
        Self {
            scope: scope.to_string(),
            tag: tag.into(),
        }
    }
}

/// A backend object, either desired (built by a controller) or realized
/// (read back from the backend, with backend-assigned fields in `body`)
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteObject {
    pub kind: RemoteKind,
    pub id: String,
    /// Policy path, the backend's identity for the object
    pub path: String,
    pub display_name: Option<String>,
    pub tags: Vec<Tag>,
    /// Kind-specific payload
    pub body: serde_json::Value,
}

impl RemoteObject {
    /// Bare reference to the object at `path`, enough to delete it
    pub fn at(kind: RemoteKind, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            kind,
            id: path.rsplit('/').next().unwrap_or_default().to_string(),
            path,
            display_name: None,
            tags: Vec::new(),
            body: serde_json::Value::Null,
        }
    }

    /// Value of the first tag with the given scope
    pub fn tag(&self, scope: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.scope == scope)
            .map(|t| t.tag.as_str())
    }

    pub fn is_owned_by(&self, res_type: &str) -> bool {
        self.tag(TAG_SCOPE_RES_TYPE) == Some(res_type)
    }

    /// Whether this (realized) object already carries everything `desired` asks for.
    ///
    /// Realized objects have extra backend-assigned fields, so only the keys
    /// present in the desired body are compared.
    pub fn satisfies(&self, desired: &RemoteObject) -> bool {
        if self.display_name != desired.display_name {
            return false;
        }

        let mut ours = self.tags.clone();
        let mut theirs = desired.tags.clone();
        ours.sort();
        theirs.sort();
        if ours != theirs {
            return false;
        }

        body_contains(&self.body, &desired.body)
    }

    /// Read an optional string field from the body, following a `/`-separated pointer
    pub fn body_str(&self, pointer: &str) -> Option<&str> {
        self.body.pointer(pointer).and_then(|v| v.as_str())
    }

    /// Read an optional boolean field from the body
    pub fn body_bool(&self, pointer: &str) -> Option<bool> {
        self.body.pointer(pointer).and_then(|v| v.as_bool())
    }
}

/// Whether `have` carries every field of `want`. Objects are compared
/// recursively so fields the backend adds (realized state) are ignored.
///
/// The backend omits or nulls boolean flags that are off, so an absent or
/// null field satisfies a desired `false`.
fn body_contains(have: &serde_json::Value, want: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (have, want) {
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(key, value)| match have.get(key) {
            Some(h) => body_contains(h, value),
            None => *value == Value::Bool(false),
        }),
        (Value::Null, Value::Bool(false)) => true,
        (have, want) => have == want,
    }
}

/// Backend release, compared component-wise
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl BackendVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for BackendVersion {
    type Err = Error;

    /// Parses versions like `4.1.2` or `4.1.2.0.0.23456789`; missing
    /// components default to zero and build suffixes are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.').map(|p| {
            p.parse::<u32>()
                .map_err(|_| Error::ConfigError(format!("invalid backend version '{}'", s)))
        });

        let major = parts
            .next()
            .ok_or_else(|| Error::ConfigError("empty backend version".to_string()))??;
        let minor = parts.next().transpose()?.unwrap_or(0);
        let patch = parts.next().transpose()?.unwrap_or(0);

        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Capability over the network backend
///
/// Implementations must treat "already exists" on create-or-update and
/// "already gone" on delete as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create the object or converge it to `object`; returns the realized object
    async fn create_or_update(&self, object: &RemoteObject) -> Result<RemoteObject>;

    /// Read an object by path; `None` when it does not exist
    async fn get(&self, kind: RemoteKind, path: &str) -> Result<Option<RemoteObject>>;

    /// Delete an object by path
    async fn delete(&self, kind: RemoteKind, path: &str) -> Result<()>;

    /// Every object of `kind` owned by this operator's cluster
    async fn list_tracked(&self, kind: RemoteKind) -> Result<Vec<RemoteObject>>;

    /// Version of the backend, used for capability gates
    async fn version(&self) -> Result<BackendVersion>;
}

/// Correlation tags for an object realizing `obj`
pub fn ownership_tags<K: Resource>(cluster: &str, res_type: &str, obj: &K) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(TAG_SCOPE_CLUSTER, cluster),
        Tag::new(TAG_SCOPE_RES_TYPE, res_type),
        Tag::new(TAG_SCOPE_NAME, obj.name_any()),
    ];
    if let Some(uid) = obj.uid() {
        tags.push(Tag::new(TAG_SCOPE_UID, uid));
    }
    if let Some(ns) = obj.namespace() {
        tags.push(Tag::new(TAG_SCOPE_NAMESPACE, ns));
    }
    tags
}

/// Tracked objects of `kinds` owned by `res_type` whose `scope` tag equals `value`
pub async fn find_tracked(
    remote: &dyn RemoteStore,
    res_type: &str,
    kinds: &[RemoteKind],
    scope: &str,
    value: &str,
) -> Result<Vec<RemoteObject>> {
    let mut found = Vec::new();
    for kind in kinds {
        found.extend(
            remote
                .list_tracked(*kind)
                .await?
                .into_iter()
                .filter(|o| o.is_owned_by(res_type) && o.tag(scope) == Some(value)),
        );
    }
    Ok(found)
}

/// Idempotent create-or-update.
///
/// Reads the current object first and skips the write when it already
/// satisfies `desired`. Returns the realized object and whether a write
/// happened.
pub async fn ensure_remote(
    remote: &dyn RemoteStore,
    desired: &RemoteObject,
) -> Result<(RemoteObject, bool)> {
    if let Some(existing) = remote.get(desired.kind, &desired.path).await? {
        if existing.satisfies(desired) {
            debug!("{} {} is up to date", desired.kind, desired.path);
            return Ok((existing, false));
        }
    }

    let realized = remote.create_or_update(desired).await?;
    debug!("{} {} written", desired.kind, desired.path);
    Ok((realized, true))
}

/// Delete objects so that referencing objects go before referenced ones.
///
/// Stops at the first failure: anything after it is still referenced and
/// would be refused anyway. Returns the number of objects deleted.
pub async fn delete_in_order(remote: &dyn RemoteStore, mut objects: Vec<RemoteObject>) -> Result<usize> {
    objects.sort_by(|a, b| {
        (a.kind.teardown_rank(), &a.path).cmp(&(b.kind.teardown_rank(), &b.path))
    });

    for object in &objects {
        remote.delete(object.kind, &object.path).await?;
        debug!("Deleted {} {}", object.kind, object.path);
    }

    Ok(objects.len())
}

/// Delete everything `res_type` owns for one identity, referencing objects first.
///
/// The tag search only sees objects the backend has indexed, so objects
/// written moments ago can be missing from it. `known` lists the paths the
/// resource is known to realize; they are deleted as well, and deleting a
/// path that does not exist is a no-op.
pub async fn delete_owned(
    remote: &dyn RemoteStore,
    res_type: &str,
    kinds: &[RemoteKind],
    scope: &str,
    value: &str,
    known: Vec<RemoteObject>,
) -> Result<usize> {
    let mut owned = find_tracked(remote, res_type, kinds, scope, value).await?;
    let mut seen: HashSet<String> = owned.iter().map(|o| o.path.clone()).collect();
    owned.extend(known.into_iter().filter(|o| seen.insert(o.path.clone())));
    delete_in_order(remote, owned).await
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBackend;
    use super::*;

    fn object(kind: RemoteKind, path: &str) -> RemoteObject {
        RemoteObject {
            kind,
            id: path.rsplit('/').next().unwrap_or_default().to_string(),
            path: path.to_string(),
            display_name: Some("obj".to_string()),
            tags: vec![Tag::new(TAG_SCOPE_UID, "u1")],
            body: serde_json::json!({"priority": 1}),
        }
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(
            "4.1.2.0.0.2345".parse::<BackendVersion>().unwrap(),
            BackendVersion::new(4, 1, 2)
        );
        assert_eq!("3".parse::<BackendVersion>().unwrap(), BackendVersion::new(3, 0, 0));
        assert!("x.y".parse::<BackendVersion>().is_err());
        assert!(BackendVersion::new(3, 2, 0) > BackendVersion::new(3, 1, 9));
    }

    #[test]
    fn test_satisfies_ignores_backend_fields_and_tag_order() {
        let desired = RemoteObject {
            tags: vec![Tag::new("a", "1"), Tag::new("b", "2")],
            ..object(RemoteKind::Group, "/infra/groups/g")
        };
        let mut realized = desired.clone();
        realized.tags.reverse();
        realized.body["_revision"] = serde_json::json!(3);
        assert!(realized.satisfies(&desired));

        realized.body["priority"] = serde_json::json!(2);
        assert!(!realized.satisfies(&desired));
    }

    #[test]
    fn test_satisfies_treats_missing_flag_as_false() {
        let desired = RemoteObject {
            body: serde_json::json!({"endpoint": {"enabled": false}, "priority": 1}),
            ..object(RemoteKind::Vpc, "/vpcs/v")
        };

        let mut realized = desired.clone();
        realized.body["endpoint"]["enabled"] = serde_json::Value::Null;
        assert!(realized.satisfies(&desired));

        realized.body["endpoint"] = serde_json::json!({});
        assert!(realized.satisfies(&desired));

        realized.body["endpoint"]["enabled"] = serde_json::json!(true);
        assert!(!realized.satisfies(&desired));

        // Only `false` has an implicit default
        let mut realized = desired.clone();
        realized.body["priority"] = serde_json::Value::Null;
        assert!(!realized.satisfies(&desired));
    }

    #[tokio::test]
    async fn test_ensure_remote_skips_unchanged() {
        let backend = MemoryBackend::new();
        let desired = object(RemoteKind::Group, "/infra/groups/g");

        let (_, wrote) = ensure_remote(&backend, &desired).await.unwrap();
        assert!(wrote);
        let (_, wrote) = ensure_remote(&backend, &desired).await.unwrap();
        assert!(!wrote);
        assert_eq!(backend.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_in_order_referencing_first() {
        let backend = MemoryBackend::new();
        let group = object(RemoteKind::Group, "/infra/groups/a");
        let policy = object(RemoteKind::SecurityPolicy, "/infra/security-policies/z");
        backend.insert(group.clone());
        backend.insert(policy.clone());

        let deleted = delete_in_order(&backend, vec![group, policy]).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(
            backend.deleted_paths(),
            vec![
                "/infra/security-policies/z".to_string(),
                "/infra/groups/a".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_in_order_stops_on_failure() {
        let mut remote = MockRemoteStore::new();
        remote
            .expect_delete()
            .withf(|kind, _| *kind == RemoteKind::Vpc)
            .times(1)
            .returning(|_, _| {
                Err(Error::Backend {
                    status: 503,
                    message: "busy".into(),
                })
            });
        remote
            .expect_delete()
            .withf(|kind, _| *kind == RemoteKind::IpBlock)
            .never();

        let result = delete_in_order(
            &remote,
            vec![
                object(RemoteKind::IpBlock, "/infra/ip-blocks/b"),
                object(RemoteKind::Vpc, "/vpcs/v"),
            ],
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_owned_covers_objects_missing_from_search() {
        let mut remote = MockRemoteStore::new();
        remote.expect_list_tracked().returning(|_| Ok(Vec::new()));
        let mut seq = mockall::Sequence::new();
        remote
            .expect_delete()
            .withf(|kind, path| *kind == RemoteKind::Vpc && path == "/vpcs/v")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        remote
            .expect_delete()
            .withf(|kind, path| *kind == RemoteKind::IpBlock && path == "/infra/ip-blocks/b")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let deleted = delete_owned(
            &remote,
            "networkinfo",
            &[RemoteKind::Vpc, RemoteKind::IpBlock],
            TAG_SCOPE_NAMESPACE,
            "shop",
            vec![
                RemoteObject::at(RemoteKind::IpBlock, "/infra/ip-blocks/b"),
                RemoteObject::at(RemoteKind::Vpc, "/vpcs/v"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn test_delete_owned_deletes_each_path_once() {
        let backend = MemoryBackend::new();
        let mut tracked = object(RemoteKind::Group, "/infra/groups/a");
        tracked.tags = vec![
            Tag::new(TAG_SCOPE_RES_TYPE, "securitypolicy"),
            Tag::new(TAG_SCOPE_UID, "u1"),
        ];
        backend.insert(tracked);

        let deleted = delete_owned(
            &backend,
            "securitypolicy",
            &[RemoteKind::Group],
            TAG_SCOPE_UID,
            "u1",
            vec![
                RemoteObject::at(RemoteKind::Group, "/infra/groups/a"),
                RemoteObject::at(RemoteKind::Group, "/infra/groups/never-written"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(backend.delete_calls(), 2);
        assert_eq!(backend.deleted_paths(), vec!["/infra/groups/a".to_string()]);
    }
}
