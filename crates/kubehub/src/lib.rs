//! Subsync kubehub: dynamic access to the runtime custom resources and a namespaced informer.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use subsync_core::{RuntimeId, SubaccountId, BETA_ENABLED_LABEL, RUNTIME_ID_LABEL, SUBACCOUNT_ID_LABEL};
use tracing::{debug, info};

mod informer;

pub use informer::{start_informer, InformerCache, ResourceEvent};

/// Label view of one runtime resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceObject {
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ResourceObject {
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        let meta = &obj.metadata;
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone(),
            labels: meta.labels.clone().unwrap_or_default(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(String::as_str) }

    pub fn subaccount_id(&self) -> Option<SubaccountId> {
        self.label(SUBACCOUNT_ID_LABEL).filter(|v| !v.is_empty()).map(SubaccountId::from)
    }

    pub fn runtime_id(&self) -> Option<RuntimeId> {
        self.label(RUNTIME_ID_LABEL).filter(|v| !v.is_empty()).map(RuntimeId::from)
    }

    /// Literal beta label, empty when absent.
    pub fn beta_enabled(&self) -> &str { self.label(BETA_ENABLED_LABEL).unwrap_or_default() }

    /// Cache key: uid when known, otherwise namespace/name.
    pub fn key(&self) -> String {
        if self.uid.is_empty() {
            format!("{}/{}", self.namespace.as_deref().unwrap_or_default(), self.name)
        } else {
            self.uid.clone()
        }
    }
}

/// Access to the labeled runtime resources in the watched namespace.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn list_by_subaccount(&self, id: &SubaccountId) -> Result<Vec<ResourceObject>>;
    /// Set one label on `obj`, guarded by its resource version when known.
    async fn set_label(&self, obj: &ResourceObject, key: &str, value: &str) -> Result<()>;
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Dynamic API over the runtime kind, scoped to one namespace.
#[derive(Clone)]
pub struct KubeResourceApi {
    api: Api<DynamicObject>,
}

impl KubeResourceApi {
    pub async fn connect(gvk_key: &str, namespace: &str) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api = if namespaced {
            Api::namespaced_with(client, namespace, &ar)
        } else {
            Api::all_with(client, &ar)
        };
        info!(gvk = %gvk_key, ns = %namespace, "resource api ready");
        Ok(Self { api })
    }

    pub fn from_api(api: Api<DynamicObject>) -> Self { Self { api } }

    pub fn api(&self) -> Api<DynamicObject> { self.api.clone() }
}

#[async_trait]
impl ResourceApi for KubeResourceApi {
    async fn list_by_subaccount(&self, id: &SubaccountId) -> Result<Vec<ResourceObject>> {
        let lp = ListParams::default().labels(&format!("{SUBACCOUNT_ID_LABEL}={id}"));
        let list = self.api.list(&lp).await.with_context(|| format!("listing resources of subaccount {id}"))?;
        Ok(list.items.iter().map(ResourceObject::from_dynamic).collect())
    }

    async fn set_label(&self, obj: &ResourceObject, key: &str, value: &str) -> Result<()> {
        let mut labels = serde_json::Map::new();
        labels.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        let mut meta = serde_json::json!({ "labels": labels });
        if let Some(rv) = &obj.resource_version {
            meta["resourceVersion"] = serde_json::Value::String(rv.clone());
        }
        let patch = serde_json::json!({ "metadata": meta });
        self.api
            .patch(&obj.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("updating label {key} on {}", obj.name))?;
        debug!(name = %obj.name, key, value, "label updated");
        Ok(())
    }
}
