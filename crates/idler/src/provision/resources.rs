//! Request bodies for every provisioned resource.
//!
//! Field names follow the Google REST representations so a spec serializes
//! directly into the body of its create call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{AlertConfig, ProvisionConfig};

pub const RECEIVED_BYTES_METRIC: &str = "compute.googleapis.com/instance/network/received_bytes_count";
pub const ALERT_POLICY_DISPLAY_NAME: &str = "Automatically shutdown when idle";
pub const ALERT_CONDITION_DISPLAY_NAME: &str = "Low received bytes";
pub const NOTIFICATION_CHANNEL_DISPLAY_NAME: &str = "Pub/Sub Notification Channel";
pub const PUBSUB_PUBLISHER_ROLE: &str = "roles/pubsub.publisher";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub name: String,
    pub auto_create_subnetworks: bool,
}

impl NetworkSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            auto_create_subnetworks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSpec {
    pub name: String,
    pub network: String,
    pub direction: String,
    pub allowed: Vec<FirewallAllow>,
    pub source_ranges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallAllow {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    pub ports: Vec<String>,
}

impl FirewallSpec {
    /// Inbound SSH from anywhere on the given network.
    pub fn ssh(name: &str, network: &str) -> Self {
        Self {
            name: name.to_string(),
            network: network.to_string(),
            direction: "INGRESS".to_string(),
            allowed: vec![FirewallAllow {
                ip_protocol: "tcp".to_string(),
                ports: vec!["22".to_string()],
            }],
            source_ranges: vec!["0.0.0.0/0".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Zone the instance is inserted into; part of the URL, not the body.
    #[serde(skip)]
    pub zone: String,
    pub name: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub scheduling: Scheduling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: DiskInitializeParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    pub source_image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    pub network: String,
    pub access_configs: Vec<AccessConfigSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfigSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    pub automatic_restart: bool,
    pub preemptible: bool,
    pub on_host_maintenance: String,
}

impl InstanceSpec {
    /// Preemptible VM that stays down once stopped or preempted.
    pub fn preemptible(config: &ProvisionConfig, zone: &str, network: &str) -> Self {
        Self {
            zone: zone.to_string(),
            name: config.instance_name.clone(),
            machine_type: format!("zones/{}/machineTypes/{}", zone, config.machine_type),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: true,
                initialize_params: DiskInitializeParams {
                    source_image: source_image(&config.boot_image),
                },
            }],
            network_interfaces: vec![NetworkInterfaceSpec {
                network: network.to_string(),
                access_configs: vec![AccessConfigSpec {
                    name: "External NAT".to_string(),
                    kind: "ONE_TO_ONE_NAT".to_string(),
                }],
            }],
            // Preemptible instances must terminate on host maintenance
            scheduling: Scheduling {
                automatic_restart: false,
                preemptible: true,
                on_host_maintenance: "TERMINATE".to_string(),
            },
        }
    }
}

/// Expand `project/family` shorthand into an image family URL.
pub fn source_image(image: &str) -> String {
    if image.starts_with("projects/") {
        return image.to_string();
    }
    match image.split_once('/') {
        Some((project, family)) => format!("projects/{}/global/images/family/{}", project, family),
        None => image.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TopicSpec {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl TopicSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: BTreeMap::new(),
        }
    }
}

/// Role binding on a topic. Authoritative for its role: the members listed
/// replace whoever held the role before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicIamBinding {
    /// Full topic path, `projects/<project>/topics/<name>`.
    pub topic: String,
    pub role: String,
    pub members: Vec<String>,
}

impl TopicIamBinding {
    /// Let Cloud Monitoring's notification agent publish to the topic.
    pub fn monitoring_publisher(topic: &str, project_number: &str) -> Self {
        Self {
            topic: topic.to_string(),
            role: PUBSUB_PUBLISHER_ROLE.to_string(),
            members: vec![format!(
                "serviceAccount:service-{}@gcp-sa-monitoring-notification.iam.gserviceaccount.com",
                project_number
            )],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationChannelSpec {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub display_name: String,
    pub labels: BTreeMap<String, String>,
}

impl NotificationChannelSpec {
    pub fn pubsub(topic: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("topic".to_string(), topic.to_string());
        Self {
            channel_type: "pubsub".to_string(),
            display_name: NOTIFICATION_CHANNEL_DISPLAY_NAME.to_string(),
            labels,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.labels.get("topic").map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Combiner {
    Or,
    And,
    AndWithMatchingResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "COMPARISON_LT")]
    LessThan,
    #[serde(rename = "COMPARISON_GT")]
    GreaterThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aligner {
    #[serde(rename = "ALIGN_MEAN")]
    Mean,
    #[serde(rename = "ALIGN_RATE")]
    Rate,
    #[serde(rename = "ALIGN_SUM")]
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPolicySpec {
    pub display_name: String,
    pub combiner: Combiner,
    pub conditions: Vec<AlertCondition>,
    pub notification_channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCondition {
    pub display_name: String,
    pub condition_threshold: ConditionThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionThreshold {
    pub filter: String,
    pub comparison: Comparison,
    pub threshold_value: f64,
    pub duration: String,
    pub trigger: Trigger,
    pub aggregations: Vec<Aggregation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    pub alignment_period: String,
    pub per_series_aligner: Aligner,
}

/// Metric filter scoping the idle condition to one instance.
pub fn idle_filter(instance_id: &str) -> String {
    format!(
        "metric.type=\"{}\" AND resource.type=\"gce_instance\" AND resource.labels.instance_id=\"{}\"",
        RECEIVED_BYTES_METRIC, instance_id
    )
}

impl AlertPolicySpec {
    /// Fire when mean received bytes stay below the threshold for the whole
    /// duration window.
    pub fn idle_shutdown(alert: &AlertConfig, instance_id: &str, channel: &str) -> Self {
        Self {
            display_name: ALERT_POLICY_DISPLAY_NAME.to_string(),
            combiner: Combiner::Or,
            conditions: vec![AlertCondition {
                display_name: ALERT_CONDITION_DISPLAY_NAME.to_string(),
                condition_threshold: ConditionThreshold {
                    filter: idle_filter(instance_id),
                    comparison: Comparison::LessThan,
                    threshold_value: alert.threshold_bytes as f64,
                    duration: format!("{}s", alert.duration_secs),
                    trigger: Trigger { percent: 100.0 },
                    aggregations: vec![Aggregation {
                        alignment_period: format!("{}s", alert.alignment_period_secs),
                        per_series_aligner: Aligner::Mean,
                    }],
                },
            }],
            notification_channels: vec![channel.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    #[serde(skip)]
    pub name: String,
    pub topic: String,
    pub push_config: PushConfig,
    pub ack_deadline_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    pub push_endpoint: String,
}

impl SubscriptionSpec {
    /// Push subscription delivering alert messages to the shutdown endpoint.
    pub fn push(name: &str, topic: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            push_config: PushConfig {
                push_endpoint: endpoint.to_string(),
            },
            // Stopping a VM can take minutes; that is the longest Pub/Sub allows
            ack_deadline_seconds: 600,
        }
    }
}
