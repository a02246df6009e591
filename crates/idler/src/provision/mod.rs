//! Provisioning of the instance and the idle-shutdown wiring.
//!
//! [`Plan`] fixes the construction order, [`Provisioner`] walks it and threads
//! each step's outputs into the specs of the steps that depend on it.

pub mod gcp;
pub mod plan;
pub mod resources;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::{config::Config, Error, Result};

pub use gcp::GcpProvisioner;
pub use plan::{Plan, Step, StepKind};
use resources::*;

/// What the instance step hands to later steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOutput {
    pub id: String,
    pub name: String,
    pub nat_ip: Option<String>,
}

/// Create-or-reuse calls against the provider. Every `ensure_*` call is
/// idempotent and returns the resource's identifying name or link.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionApi: Send + Sync {
    async fn project_number(&self) -> Result<String>;
    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<String>;
    async fn ensure_firewall(&self, spec: &FirewallSpec) -> Result<String>;
    async fn ensure_instance(&self, spec: &InstanceSpec) -> Result<InstanceOutput>;
    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<String>;
    async fn bind_topic_iam(&self, binding: &TopicIamBinding) -> Result<()>;
    async fn ensure_notification_channel(&self, spec: &NotificationChannelSpec) -> Result<String>;
    async fn ensure_alert_policy(&self, spec: &AlertPolicySpec) -> Result<String>;
    async fn ensure_subscription(&self, spec: &SubscriptionSpec) -> Result<String>;
}

/// Values produced while applying a plan.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOutputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(rename = "instanceIP", skip_serializing_if = "Option::is_none")]
    pub instance_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
}

fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| Error::Internal(format!("{} is not available yet", what)))
}

pub struct Provisioner {
    api: Arc<dyn ProvisionApi>,
    config: Config,
}

impl Provisioner {
    pub fn new(api: Arc<dyn ProvisionApi>, config: Config) -> Self {
        Self { api, config }
    }

    pub async fn apply(&self, plan: &Plan) -> Result<ProvisionOutputs> {
        let mut outputs = ProvisionOutputs::default();
        for step in plan.steps() {
            info!("Applying step {}", step.kind);
            self.apply_step(step.kind, &mut outputs).await?;
        }
        Ok(outputs)
    }

    async fn apply_step(&self, kind: StepKind, outputs: &mut ProvisionOutputs) -> Result<()> {
        let provision = &self.config.provision;
        match kind {
            StepKind::Project => {
                outputs.project_number = Some(self.api.project_number().await?);
            }
            StepKind::Network => {
                let spec = NetworkSpec::new(&provision.network_name);
                outputs.network = Some(self.api.ensure_network(&spec).await?);
            }
            StepKind::Firewall => {
                let spec = FirewallSpec::ssh(&provision.firewall_name, require(&outputs.network, "network")?);
                outputs.firewall = Some(self.api.ensure_firewall(&spec).await?);
            }
            StepKind::Instance => {
                let spec = InstanceSpec::preemptible(
                    provision,
                    &self.config.gcp.zone,
                    require(&outputs.network, "network")?,
                );
                let instance = self.api.ensure_instance(&spec).await?;
                info!("Instance {} has id {}", instance.name, instance.id);
                outputs.instance_name = Some(instance.name);
                outputs.instance_id = Some(instance.id);
                outputs.instance_ip = instance.nat_ip;
            }
            StepKind::Topic => {
                let spec = TopicSpec::new(&provision.topic_name);
                outputs.topic = Some(self.api.ensure_topic(&spec).await?);
            }
            StepKind::TopicIam => {
                let binding = TopicIamBinding::monitoring_publisher(
                    require(&outputs.topic, "topic")?,
                    require(&outputs.project_number, "project number")?,
                );
                self.api.bind_topic_iam(&binding).await?;
            }
            StepKind::NotificationChannel => {
                let spec = NotificationChannelSpec::pubsub(require(&outputs.topic, "topic")?);
                outputs.notification_channel = Some(self.api.ensure_notification_channel(&spec).await?);
            }
            StepKind::AlertPolicy => {
                let spec = AlertPolicySpec::idle_shutdown(
                    &provision.alert,
                    require(&outputs.instance_id, "instance id")?,
                    require(&outputs.notification_channel, "notification channel")?,
                );
                outputs.alert_policy = Some(self.api.ensure_alert_policy(&spec).await?);
            }
            StepKind::PushSubscription => {
                let endpoint = require(&provision.push_endpoint, "push endpoint")?;
                let endpoint = push_endpoint_with_token(endpoint, self.config.auth.pubsub_token.as_deref())?;
                let spec = SubscriptionSpec::push(
                    &provision.subscription_name,
                    require(&outputs.topic, "topic")?,
                    &endpoint,
                );
                outputs.subscription = Some(self.api.ensure_subscription(&spec).await?);
            }
        }
        Ok(())
    }
}

/// Append the verification token the shutdown endpoint expects.
pub fn push_endpoint_with_token(endpoint: &str, token: Option<&str>) -> Result<String> {
    let mut url = Url::parse(endpoint)?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::function;
    use mockall::Sequence;

    fn config() -> Config {
        let mut config = Config::default();
        config.gcp.project = "dev-project".into();
        config
    }

    fn expect_base(api: &mut MockProvisionApi, seq: &mut Sequence) {
        api.expect_ensure_network()
            .times(1)
            .in_sequence(seq)
            .returning(|spec| Ok(format!("projects/dev-project/global/networks/{}", spec.name)));
        api.expect_ensure_firewall()
            .with(function(|spec: &FirewallSpec| {
                spec.network == "projects/dev-project/global/networks/network"
            }))
            .times(1)
            .in_sequence(seq)
            .returning(|spec| Ok(spec.name.clone()));
        api.expect_ensure_instance()
            .with(function(|spec: &InstanceSpec| {
                spec.zone == "us-central1-a"
                    && spec.network_interfaces[0].network == "projects/dev-project/global/networks/network"
            }))
            .times(1)
            .in_sequence(seq)
            .returning(|spec| {
                Ok(InstanceOutput {
                    id: "1234567890".into(),
                    name: spec.name.clone(),
                    nat_ip: Some("34.1.2.3".into()),
                })
            });
        api.expect_ensure_topic()
            .times(1)
            .in_sequence(seq)
            .returning(|spec| Ok(format!("projects/dev-project/topics/{}", spec.name)));
        api.expect_project_number()
            .times(1)
            .in_sequence(seq)
            .returning(|| Ok("987654321".into()));
        api.expect_bind_topic_iam()
            .with(function(|b: &TopicIamBinding| {
                b.topic == "projects/dev-project/topics/shutdown-idle-instance"
                    && b.members[0].contains("service-987654321@")
            }))
            .times(1)
            .in_sequence(seq)
            .returning(|_| Ok(()));
        api.expect_ensure_notification_channel()
            .with(function(|spec: &NotificationChannelSpec| {
                spec.topic() == Some("projects/dev-project/topics/shutdown-idle-instance")
            }))
            .times(1)
            .in_sequence(seq)
            .returning(|_| Ok("projects/dev-project/notificationChannels/42".into()));
        api.expect_ensure_alert_policy()
            .with(function(|spec: &AlertPolicySpec| {
                spec.notification_channels == vec!["projects/dev-project/notificationChannels/42".to_string()]
                    && spec.conditions[0]
                        .condition_threshold
                        .filter
                        .ends_with("resource.labels.instance_id=\"1234567890\"")
            }))
            .times(1)
            .in_sequence(seq)
            .returning(|_| Ok("projects/dev-project/alertPolicies/7".into()));
    }

    #[tokio::test]
    async fn apply_threads_outputs_through_the_plan() {
        let mut api = MockProvisionApi::new();
        let mut seq = Sequence::new();
        expect_base(&mut api, &mut seq);
        api.expect_ensure_subscription().never();

        let config = config();
        let plan = Plan::for_config(&config.provision).unwrap();
        let outputs = Provisioner::new(Arc::new(api), config).apply(&plan).await.unwrap();

        assert_eq!(outputs.instance_id.as_deref(), Some("1234567890"));
        assert_eq!(outputs.instance_name.as_deref(), Some("code-server"));
        assert_eq!(outputs.instance_ip.as_deref(), Some("34.1.2.3"));
        assert_eq!(outputs.alert_policy.as_deref(), Some("projects/dev-project/alertPolicies/7"));

        let exported = serde_json::to_value(&outputs).unwrap();
        assert_eq!(exported["instanceIP"], "34.1.2.3");
        assert_eq!(exported["instanceName"], "code-server");
    }

    #[tokio::test]
    async fn push_subscription_carries_verification_token() {
        let mut api = MockProvisionApi::new();
        let mut seq = Sequence::new();
        expect_base(&mut api, &mut seq);
        api.expect_ensure_subscription()
            .with(function(|spec: &SubscriptionSpec| {
                spec.push_config.push_endpoint == "https://idler.example.com/pubsub/shutdown?token=s3cr3t"
                    && spec.topic == "projects/dev-project/topics/shutdown-idle-instance"
            }))
            .times(1)
            .returning(|spec| Ok(format!("projects/dev-project/subscriptions/{}", spec.name)));

        let mut config = config();
        config.provision.push_endpoint = Some("https://idler.example.com/pubsub/shutdown".into());
        config.auth.pubsub_token = Some("s3cr3t".into());
        let plan = Plan::for_config(&config.provision).unwrap();
        let outputs = Provisioner::new(Arc::new(api), config).apply(&plan).await.unwrap();

        assert_eq!(
            outputs.subscription.as_deref(),
            Some("projects/dev-project/subscriptions/shutdown-idle-instance-push")
        );
    }

    #[tokio::test]
    async fn failed_step_stops_the_walk() {
        let mut api = MockProvisionApi::new();
        api.expect_ensure_network().returning(|_| {
            Err(Error::Provider {
                status: 403,
                message: "PERMISSION_DENIED".into(),
            })
        });
        api.expect_ensure_firewall().never();
        api.expect_ensure_instance().never();
        api.expect_ensure_alert_policy().never();

        let config = config();
        let plan = Plan::for_config(&config.provision).unwrap();
        let result = Provisioner::new(Arc::new(api), config).apply(&plan).await;
        assert!(matches!(result, Err(Error::Provider { status: 403, .. })));
    }

    #[test]
    fn push_endpoint_token_is_url_encoded() {
        assert_eq!(
            push_endpoint_with_token("https://h.example.com/pubsub/shutdown", Some("a b&c")).unwrap(),
            "https://h.example.com/pubsub/shutdown?token=a+b%26c"
        );
        assert_eq!(
            push_endpoint_with_token("https://h.example.com/pubsub/shutdown", None).unwrap(),
            "https://h.example.com/pubsub/shutdown"
        );
        assert!(push_endpoint_with_token("not a url", None).is_err());
    }
}
