//! Compute Engine v1 REST client.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{short_name, GcpHttp};
use crate::{
    compute::{ComputeApi, InstanceRef, Operation},
    config::GcpConfig,
    Result,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedInstanceList {
    #[serde(default)]
    items: BTreeMap<String, InstancesScopedList>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstancesScopedList {
    #[serde(default)]
    instances: Vec<Instance>,
}

/// Instance resource as returned by `instances.get` and `aggregatedList`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub zone: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default, rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    #[serde(default, rename = "natIP")]
    pub nat_ip: Option<String>,
}

impl Instance {
    /// External address of the first interface, if it has one.
    pub fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .and_then(|nic| nic.access_configs.first())
            .and_then(|ac| ac.nat_ip.as_deref())
    }
}

impl From<Instance> for InstanceRef {
    fn from(instance: Instance) -> Self {
        InstanceRef {
            zone: short_name(&instance.zone).to_string(),
            id: instance.id,
            name: instance.name,
            status: instance.status,
        }
    }
}

pub struct GceClient {
    http: Arc<GcpHttp>,
    endpoint: String,
    project: String,
}

impl GceClient {
    pub fn new(http: Arc<GcpHttp>, config: &GcpConfig) -> Self {
        Self {
            http,
            endpoint: config.compute_endpoint.trim_end_matches('/').to_string(),
            project: config.project.clone(),
        }
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.endpoint, self.project)
    }

    fn operation_wait_url(&self, operation: &Operation) -> String {
        match &operation.zone {
            Some(zone) => format!(
                "{}/zones/{}/operations/{}/wait",
                self.project_url(),
                short_name(zone),
                operation.name
            ),
            None => format!(
                "{}/global/operations/{}/wait",
                self.project_url(),
                operation.name
            ),
        }
    }

    async fn instance_action(&self, instance: &InstanceRef, action: &str) -> Result<Operation> {
        let url = format!(
            "{}/zones/{}/instances/{}/{}",
            self.project_url(),
            instance.zone,
            instance.name,
            action
        );
        info!("Requesting {} of instance {} ({})", action, instance.name, instance.id);
        self.http
            .post(&url, &[("requestId", Uuid::new_v4().to_string())], &json!({}))
            .await
    }

    /// Insert a resource into a collection such as `global/networks` or
    /// `zones/us-central1-a/instances`.
    pub async fn insert<B: Serialize + ?Sized>(&self, collection: &str, body: &B) -> Result<Operation> {
        let url = format!("{}/{}", self.project_url(), collection);
        self.http
            .post(&url, &[("requestId", Uuid::new_v4().to_string())], body)
            .await
    }

    /// Fetch a resource by its project-relative path, e.g. `global/networks/network`.
    pub async fn get_resource<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.project_url(), path);
        self.http.get(&url, &[]).await
    }

    pub async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance> {
        self.get_resource(&format!("zones/{}/instances/{}", zone, name))
            .await
    }
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn list_instances(&self, filter: &str) -> Result<Vec<InstanceRef>> {
        let url = format!("{}/aggregated/instances", self.project_url());
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("filter", filter.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: AggregatedInstanceList = self.http.get(&url, &query).await?;
            for scoped in page.items.into_values() {
                instances.extend(scoped.instances.into_iter().map(InstanceRef::from));
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(instances)
    }

    async fn start_instance(&self, instance: &InstanceRef) -> Result<Operation> {
        self.instance_action(instance, "start").await
    }

    async fn stop_instance(&self, instance: &InstanceRef) -> Result<Operation> {
        self.instance_action(instance, "stop").await
    }

    async fn wait_for_operation(&self, operation: &Operation) -> Result<Operation> {
        let mut current = operation.clone();
        // The wait endpoint returns after at most two minutes, DONE or not
        while !current.is_done() {
            debug!("Waiting on operation {} ({:?})", current.name, current.status);
            current = self
                .http
                .post(&self.operation_wait_url(&current), &[], &json!({}))
                .await?;
        }
        Ok(current)
    }
}
