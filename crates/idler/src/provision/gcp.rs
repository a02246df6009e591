//! [`ProvisionApi`] against the Compute Engine, Pub/Sub, Cloud Monitoring and
//! Resource Manager REST APIs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::{resources::*, InstanceOutput, ProvisionApi};
use crate::{
    compute::{ComputeApi, Operation},
    config::GcpConfig,
    gcp::{GceClient, GcpHttp},
    Error, Result,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Project {
    project_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelfLinked {
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IamPolicy {
    #[serde(default)]
    bindings: Vec<IamBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IamBinding {
    role: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelList {
    #[serde(default)]
    notification_channels: Vec<ExistingChannel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExistingChannel {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyList {
    #[serde(default)]
    alert_policies: Vec<ExistingPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExistingPolicy {
    name: String,
    #[serde(default)]
    display_name: String,
}

/// Insert outcomes that mean the resource is already there.
fn already_exists(error: &Error) -> bool {
    if error.is_conflict() {
        return true;
    }
    match error {
        Error::Operation { message, .. } => {
            let message = message.to_ascii_uppercase();
            message.contains("ALREADY_EXISTS") || message.contains("ALREADYEXISTS")
        }
        _ => false,
    }
}

/// Replace the members of `role`, leaving other bindings untouched.
fn apply_binding(policy: &mut IamPolicy, binding: &TopicIamBinding) {
    policy.bindings.retain(|b| b.role != binding.role);
    policy.bindings.push(IamBinding {
        role: binding.role.clone(),
        members: binding.members.clone(),
    });
}

pub struct GcpProvisioner {
    http: Arc<GcpHttp>,
    compute: GceClient,
    project: String,
    pubsub_endpoint: String,
    monitoring_endpoint: String,
    resource_manager_endpoint: String,
}

impl GcpProvisioner {
    pub fn new(http: Arc<GcpHttp>, config: &GcpConfig) -> Self {
        Self {
            compute: GceClient::new(http.clone(), config),
            http,
            project: config.project.clone(),
            pubsub_endpoint: config.pubsub_endpoint.trim_end_matches('/').to_string(),
            monitoring_endpoint: config.monitoring_endpoint.trim_end_matches('/').to_string(),
            resource_manager_endpoint: config.resource_manager_endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn pubsub_url(&self, path: &str) -> String {
        format!("{}/{}", self.pubsub_endpoint, path)
    }

    fn monitoring_url(&self, collection: &str) -> String {
        format!("{}/projects/{}/{}", self.monitoring_endpoint, self.project, collection)
    }

    /// Insert a compute resource and wait for it, tolerating an existing one.
    async fn insert_and_wait<B: Serialize + Sync>(&self, collection: &str, name: &str, body: &B) -> Result<()> {
        let result = match self.compute.insert(collection, body).await {
            Ok(operation) => self.finish(operation).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!("Created {}/{}", collection, name);
                Ok(())
            }
            Err(e) if already_exists(&e) => {
                info!("{}/{} already exists, reusing it", collection, name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn finish(&self, operation: Operation) -> Result<()> {
        self.compute.wait_for_operation(&operation).await?.into_result()?;
        Ok(())
    }
}

#[async_trait]
impl ProvisionApi for GcpProvisioner {
    async fn project_number(&self) -> Result<String> {
        let url = format!("{}/projects/{}", self.resource_manager_endpoint, self.project);
        let project: Project = self.http.get(&url, &[]).await?;
        Ok(project.project_number)
    }

    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<String> {
        self.insert_and_wait("global/networks", &spec.name, spec).await?;
        let network: SelfLinked = self
            .compute
            .get_resource(&format!("global/networks/{}", spec.name))
            .await?;
        Ok(network.self_link)
    }

    async fn ensure_firewall(&self, spec: &FirewallSpec) -> Result<String> {
        self.insert_and_wait("global/firewalls", &spec.name, spec).await?;
        let firewall: SelfLinked = self
            .compute
            .get_resource(&format!("global/firewalls/{}", spec.name))
            .await?;
        Ok(firewall.self_link)
    }

    async fn ensure_instance(&self, spec: &InstanceSpec) -> Result<InstanceOutput> {
        let collection = format!("zones/{}/instances", spec.zone);
        self.insert_and_wait(&collection, &spec.name, spec).await?;
        let instance = self.compute.get_instance(&spec.zone, &spec.name).await?;
        Ok(InstanceOutput {
            nat_ip: instance.nat_ip().map(str::to_string),
            id: instance.id,
            name: instance.name,
        })
    }

    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<String> {
        let path = format!("projects/{}/topics/{}", self.project, spec.name);
        match self.http.put::<_, Named>(&self.pubsub_url(&path), spec).await {
            Ok(topic) => {
                info!("Created topic {}", topic.name);
                Ok(topic.name)
            }
            Err(e) if already_exists(&e) => {
                info!("Topic {} already exists, reusing it", path);
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }

    async fn bind_topic_iam(&self, binding: &TopicIamBinding) -> Result<()> {
        // Pub/Sub reads topic policies with GET, unlike Resource Manager
        let mut policy: IamPolicy = self
            .http
            .get(&self.pubsub_url(&format!("{}:getIamPolicy", binding.topic)), &[])
            .await?;
        apply_binding(&mut policy, binding);

        let _: IamPolicy = self
            .http
            .post(
                &self.pubsub_url(&format!("{}:setIamPolicy", binding.topic)),
                &[],
                &json!({ "policy": policy }),
            )
            .await?;
        info!("Granted {} on {} to {:?}", binding.role, binding.topic, binding.members);
        Ok(())
    }

    async fn ensure_notification_channel(&self, spec: &NotificationChannelSpec) -> Result<String> {
        let url = self.monitoring_url("notificationChannels");
        let existing: ChannelList = self
            .http
            .get(&url, &[("filter", format!("type=\"{}\"", spec.channel_type))])
            .await?;

        let topic = spec.topic();
        if let Some(channel) = existing
            .notification_channels
            .into_iter()
            .find(|c| c.labels.get("topic").map(String::as_str) == topic)
        {
            info!("Notification channel {} already targets the topic", channel.name);
            return Ok(channel.name);
        }

        let created: Named = self.http.post(&url, &[], spec).await?;
        info!("Created notification channel {}", created.name);
        Ok(created.name)
    }

    async fn ensure_alert_policy(&self, spec: &AlertPolicySpec) -> Result<String> {
        let url = self.monitoring_url("alertPolicies");
        let existing: PolicyList = self
            .http
            .get(&url, &[("pageSize", "1000".to_string())])
            .await?;

        if let Some(policy) = existing
            .alert_policies
            .into_iter()
            .find(|p| p.display_name == spec.display_name)
        {
            // The instance id in the filter changes when the VM is recreated
            let update_url = format!("{}/{}", self.monitoring_endpoint, policy.name);
            let updated: Named = self.http.patch(&update_url, spec).await?;
            info!("Updated alert policy {}", updated.name);
            return Ok(updated.name);
        }

        let created: Named = self.http.post(&url, &[], spec).await?;
        info!("Created alert policy {}", created.name);
        Ok(created.name)
    }

    async fn ensure_subscription(&self, spec: &SubscriptionSpec) -> Result<String> {
        let path = format!("projects/{}/subscriptions/{}", self.project, spec.name);
        match self.http.put::<_, Named>(&self.pubsub_url(&path), spec).await {
            Ok(subscription) => {
                info!("Created push subscription {}", subscription.name);
                Ok(subscription.name)
            }
            Err(e) if already_exists(&e) => {
                // Keep the endpoint current when the service URL or token changed
                let _: serde_json::Value = self
                    .http
                    .post(
                        &self.pubsub_url(&format!("{}:modifyPushConfig", path)),
                        &[],
                        &json!({ "pushConfig": spec.push_config }),
                    )
                    .await?;
                info!("Subscription {} already exists, push config refreshed", path);
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_covers_http_and_operation_errors() {
        assert!(already_exists(&Error::Provider {
            status: 409,
            message: "ALREADY_EXISTS: Resource already exists".into(),
        }));
        assert!(already_exists(&Error::Operation {
            operation: "op".into(),
            message: "alreadyExists: The resource 'projects/p/global/networks/network' already exists".into(),
        }));
        assert!(!already_exists(&Error::Operation {
            operation: "op".into(),
            message: "QUOTA_EXCEEDED: too many networks".into(),
        }));
        assert!(!already_exists(&Error::Provider {
            status: 404,
            message: "NOT_FOUND".into(),
        }));
    }

    #[test]
    fn binding_replaces_members_of_its_role_only() {
        let mut policy: IamPolicy = serde_json::from_str(
            r#"{
                "version": 1,
                "etag": "BwW=",
                "bindings": [
                    {"role": "roles/pubsub.publisher", "members": ["user:old@example.com"]},
                    {"role": "roles/pubsub.viewer", "members": ["user:viewer@example.com"]}
                ]
            }"#,
        )
        .unwrap();

        let binding = TopicIamBinding::monitoring_publisher("projects/p/topics/t", "42");
        apply_binding(&mut policy, &binding);

        assert_eq!(policy.bindings.len(), 2);
        let publisher = policy
            .bindings
            .iter()
            .find(|b| b.role == PUBSUB_PUBLISHER_ROLE)
            .unwrap();
        assert_eq!(publisher.members, binding.members);
        assert!(policy.bindings.iter().any(|b| b.role == "roles/pubsub.viewer"));

        // The etag is sent back so concurrent edits are detected
        let body = serde_json::to_value(&policy).unwrap();
        assert_eq!(body["etag"], "BwW=");
    }

    #[test]
    fn binding_on_empty_policy() {
        let mut policy = IamPolicy::default();
        apply_binding(&mut policy, &TopicIamBinding::monitoring_publisher("t", "1"));
        assert_eq!(policy.bindings.len(), 1);
    }
}
