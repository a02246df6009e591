use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{error, info, warn};

use crate::{compute::InstanceController, metrics, Result};

/// Incident state that triggers a shutdown.
pub const OPEN_STATE: &str = "open";

/// Accept any JSON value for fields that are only ever logged, so a field of an
/// unexpected shape cannot reject the whole message.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// Pub/Sub push delivery payload
#[derive(Debug, Deserialize, Serialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64 encoded JSON body published by Cloud Monitoring.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub publish_time: Option<String>,
}

// Cloud Monitoring notification body
#[derive(Debug, Deserialize, Serialize)]
pub struct AlertNotification {
    #[serde(default)]
    pub incident: Option<Incident>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Incident {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub incident_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub policy_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub condition_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub resource_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
}

/// Why a message was acknowledged without touching the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MalformedEnvelope,
    MissingData,
    InvalidBase64,
    InvalidJson,
    MissingState,
    NotOpen(String),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MalformedEnvelope => "malformed_envelope",
            SkipReason::MissingData => "missing_data",
            SkipReason::InvalidBase64 => "invalid_base64",
            SkipReason::InvalidJson => "invalid_json",
            SkipReason::MissingState => "missing_state",
            SkipReason::NotOpen(_) => "not_open",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotOpen(state) => write!(f, "incident state is '{}'", state),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Stopped { instances: usize },
    Skipped(SkipReason),
}

/// Parse a push request body down to the alert notification it carries.
pub fn decode_push(body: &[u8]) -> std::result::Result<AlertNotification, SkipReason> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(|_| SkipReason::MalformedEnvelope)?;
    let data = envelope.message.data.ok_or(SkipReason::MissingData)?;
    decode_data(&data)
}

/// Decode the base64 `data` field of a Pub/Sub message.
pub fn decode_data(data: &str) -> std::result::Result<AlertNotification, SkipReason> {
    let data = data.trim();
    if data.is_empty() {
        return Err(SkipReason::MissingData);
    }
    let bytes = STANDARD.decode(data).map_err(|_| SkipReason::InvalidBase64)?;
    serde_json::from_slice(&bytes).map_err(|_| SkipReason::InvalidJson)
}

/// Decide whether a notification should stop the instance.
pub fn should_stop(notification: &AlertNotification) -> std::result::Result<&Incident, SkipReason> {
    let incident = notification.incident.as_ref().ok_or(SkipReason::MissingState)?;
    match incident.state.as_deref() {
        Some(OPEN_STATE) => Ok(incident),
        Some(other) => Err(SkipReason::NotOpen(other.to_string())),
        None => Err(SkipReason::MissingState),
    }
}

/// Stops the code-server instance when the idle alert opens an incident.
pub struct ShutdownHandler {
    controller: InstanceController,
    identifier: String,
}

impl ShutdownHandler {
    pub fn new(controller: InstanceController, identifier: String) -> Self {
        Self {
            controller,
            identifier,
        }
    }

    /// Handle a raw push request body. Only a failed stop is an error.
    pub async fn handle_push(&self, body: &[u8]) -> Result<ShutdownOutcome> {
        match decode_push(body) {
            Ok(notification) => self.handle_notification(notification).await,
            Err(reason) => Ok(self.skip(reason)),
        }
    }

    pub async fn handle_notification(&self, notification: AlertNotification) -> Result<ShutdownOutcome> {
        let incident = match should_stop(&notification) {
            Ok(incident) => incident,
            Err(reason) => return Ok(self.skip(reason)),
        };

        info!(
            "Incident {} for policy {} is open, stopping '{}'",
            incident.incident_id.as_deref().unwrap_or("unknown"),
            incident.policy_name.as_deref().unwrap_or("unknown"),
            self.identifier
        );

        match self.controller.stop(&self.identifier).await {
            Ok(instances) => {
                metrics::ALERT_MESSAGES_TOTAL.with_label_values(&["stopped"]).inc();
                Ok(ShutdownOutcome::Stopped { instances })
            }
            Err(e) => {
                error!("Failed to stop '{}': {}", self.identifier, e);
                metrics::ALERT_MESSAGES_TOTAL.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    fn skip(&self, reason: SkipReason) -> ShutdownOutcome {
        match &reason {
            SkipReason::NotOpen(_) => info!("Ignoring alert message: {}", reason),
            _ => warn!("Ignoring alert message: {}", reason),
        }
        metrics::ALERT_MESSAGES_TOTAL
            .with_label_values(&[reason.as_str()])
            .inc();
        ShutdownOutcome::Skipped(reason)
    }
}
