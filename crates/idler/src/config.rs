use serde::{Deserialize, Serialize};

/// What to do when the instance identifier does not resolve to exactly one VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Operate on every match. No matches is a no-op.
    #[serde(rename = "fanout")]
    FanOut,
    /// Fail unless exactly one instance matches.
    #[serde(rename = "exactly-one")]
    ExactlyOne,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::FanOut
    }
}

impl std::str::FromStr for MatchPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fanout" | "fan-out" => Ok(MatchPolicy::FanOut),
            "exactly-one" | "exactly_one" | "strict" => Ok(MatchPolicy::ExactlyOne),
            other => Err(crate::Error::Config(format!(
                "Unknown INSTANCE_MATCH_POLICY '{}', expected 'fanout' or 'exactly-one'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub instance: InstanceConfig,
    pub gcp: GcpConfig,
    pub provision: ProvisionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Shared secret expected after `token ` in the Authorization header.
    pub secret: String,
    /// Token the push subscription must pass as `?token=`.
    pub pubsub_token: Option<String>,
}

// Keep secrets out of logged configuration.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &redact(&self.secret))
            .field("pubsub_token", &self.pubsub_token.as_deref().map(redact))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceConfig {
    /// Instance id (numeric) or name of the code-server VM.
    pub identifier: String,
    #[serde(default)]
    pub match_policy: MatchPolicy,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    pub project: String,
    pub zone: String,
    /// Static bearer token. When unset, tokens come from the metadata server.
    pub access_token: Option<String>,
    pub metadata_host: String,
    pub compute_endpoint: String,
    pub pubsub_endpoint: String,
    pub monitoring_endpoint: String,
    pub resource_manager_endpoint: String,
}

impl std::fmt::Debug for GcpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpConfig")
            .field("project", &self.project)
            .field("zone", &self.zone)
            .field("access_token", &self.access_token.as_deref().map(redact))
            .field("metadata_host", &self.metadata_host)
            .field("compute_endpoint", &self.compute_endpoint)
            .field("pubsub_endpoint", &self.pubsub_endpoint)
            .field("monitoring_endpoint", &self.monitoring_endpoint)
            .field("resource_manager_endpoint", &self.resource_manager_endpoint)
            .finish()
    }
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: "us-central1-a".to_string(),
            access_token: None,
            metadata_host: "metadata.google.internal".to_string(),
            compute_endpoint: "https://compute.googleapis.com/compute/v1".to_string(),
            pubsub_endpoint: "https://pubsub.googleapis.com/v1".to_string(),
            monitoring_endpoint: "https://monitoring.googleapis.com/v3".to_string(),
            resource_manager_endpoint: "https://cloudresourcemanager.googleapis.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub instance_name: String,
    pub machine_type: String,
    /// `<image project>/<image family>`, e.g. `ubuntu-os-cloud/ubuntu-2204-lts`.
    pub boot_image: String,
    pub network_name: String,
    pub firewall_name: String,
    pub topic_name: String,
    pub subscription_name: String,
    /// Where the push subscription delivers alert messages. No subscription
    /// is provisioned when unset.
    pub push_endpoint: Option<String>,
    pub alert: AlertConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            instance_name: "code-server".to_string(),
            machine_type: "n2d-standard-2".to_string(),
            boot_image: "ubuntu-os-cloud/ubuntu-2204-lts".to_string(),
            network_name: "network".to_string(),
            firewall_name: "firewall".to_string(),
            topic_name: "shutdown-idle-instance".to_string(),
            subscription_name: "shutdown-idle-instance-push".to_string(),
            push_endpoint: None,
            alert: AlertConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertConfig {
    /// Mean received bytes per alignment period below which the VM is idle.
    pub threshold_bytes: u64,
    pub duration_secs: u64,
    pub alignment_period_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 300 * 1024,
            duration_secs: 30 * 60,
            alignment_period_secs: 5 * 60,
        }
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = Config::default();

        let addr = match std::env::var("PORT").ok().filter(|p| !p.is_empty()) {
            Some(port) => format!("0.0.0.0:{}", port),
            None => std::env::var("SERVER_ADDR").unwrap_or(defaults.server.addr),
        };

        let match_policy = match std::env::var("INSTANCE_MATCH_POLICY") {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => MatchPolicy::default(),
        };

        let config = Config {
            server: ServerConfig { addr },
            auth: AuthConfig {
                secret: std::env::var("AUTH_SECRET").unwrap_or_default(),
                pubsub_token: non_empty_var("PUBSUB_VERIFICATION_TOKEN"),
            },
            instance: InstanceConfig {
                identifier: std::env::var("CODE_SERVER_INSTANCE_ID")
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                match_policy,
            },
            gcp: GcpConfig {
                project: std::env::var("GCP_PROJECT").unwrap_or_default(),
                zone: std::env::var("GCP_ZONE").unwrap_or(defaults.gcp.zone),
                access_token: non_empty_var("GCP_ACCESS_TOKEN"),
                metadata_host: std::env::var("GCE_METADATA_HOST")
                    .unwrap_or(defaults.gcp.metadata_host),
                ..defaults.gcp
            },
            provision: ProvisionConfig {
                instance_name: std::env::var("INSTANCE_NAME")
                    .unwrap_or(defaults.provision.instance_name),
                machine_type: std::env::var("MACHINE_TYPE")
                    .unwrap_or(defaults.provision.machine_type),
                boot_image: std::env::var("BOOT_IMAGE").unwrap_or(defaults.provision.boot_image),
                network_name: std::env::var("NETWORK_NAME")
                    .unwrap_or(defaults.provision.network_name),
                firewall_name: std::env::var("FIREWALL_NAME")
                    .unwrap_or(defaults.provision.firewall_name),
                topic_name: std::env::var("TOPIC_NAME").unwrap_or(defaults.provision.topic_name),
                subscription_name: std::env::var("SUBSCRIPTION_NAME")
                    .unwrap_or(defaults.provision.subscription_name),
                push_endpoint: non_empty_var("PUSH_ENDPOINT"),
                alert: AlertConfig {
                    threshold_bytes: parse_var(
                        "IDLE_THRESHOLD_BYTES",
                        defaults.provision.alert.threshold_bytes,
                    )?,
                    duration_secs: parse_var(
                        "IDLE_DURATION_SECS",
                        defaults.provision.alert.duration_secs,
                    )?,
                    alignment_period_secs: parse_var(
                        "ALIGNMENT_PERIOD_SECS",
                        defaults.provision.alert.alignment_period_secs,
                    )?,
                },
            },
        };

        if config.gcp.project.is_empty() {
            tracing::warn!("GCP_PROJECT is not set. Provider calls will fail.");
        }

        Ok(config)
    }

    /// Settings the HTTP handlers cannot run without.
    pub fn validate_for_server(&self) -> crate::Result<()> {
        if self.auth.secret.is_empty() {
            return Err(crate::Error::Config(
                "AUTH_SECRET must be set to serve start requests".to_string(),
            ));
        }
        if self.instance.identifier.is_empty() {
            return Err(crate::Error::Config(
                "CODE_SERVER_INSTANCE_ID must be set to serve requests".to_string(),
            ));
        }
        if self.gcp.project.is_empty() {
            return Err(crate::Error::Config("GCP_PROJECT must be set".to_string()));
        }
        Ok(())
    }

    pub fn validate_for_provision(&self) -> crate::Result<()> {
        if self.gcp.project.is_empty() {
            return Err(crate::Error::Config("GCP_PROJECT must be set".to_string()));
        }
        let alert = &self.provision.alert;
        if alert.alignment_period_secs == 0 || alert.duration_secs == 0 {
            return Err(crate::Error::Config(
                "IDLE_DURATION_SECS and ALIGNMENT_PERIOD_SECS must be positive".to_string(),
            ));
        }
        if alert.alignment_period_secs > alert.duration_secs {
            return Err(crate::Error::Config(
                "ALIGNMENT_PERIOD_SECS must not exceed IDLE_DURATION_SECS".to_string(),
            ));
        }
        if !self.provision.boot_image.contains('/') {
            return Err(crate::Error::Config(format!(
                "BOOT_IMAGE '{}' must look like <project>/<family>",
                self.provision.boot_image
            )));
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var(key: &str, default: u64) -> crate::Result<u64> {
    match non_empty_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| crate::Error::Config(format!("{} must be an integer, got '{}'", key, raw))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            auth: AuthConfig::default(),
            instance: InstanceConfig::default(),
            gcp: GcpConfig::default(),
            provision: ProvisionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_ready() -> Config {
        let mut config = Config::default();
        config.auth.secret = "SECRET".into();
        config.instance.identifier = "1234567890".into();
        config.gcp.project = "dev-project".into();
        config
    }

    #[test]
    fn defaults_match_idle_alert_values() {
        let alert = AlertConfig::default();
        assert_eq!(alert.threshold_bytes, 307_200);
        assert_eq!(alert.duration_secs, 1800);
        assert_eq!(alert.alignment_period_secs, 300);

        let provision = ProvisionConfig::default();
        assert_eq!(provision.instance_name, "code-server");
        assert_eq!(provision.machine_type, "n2d-standard-2");
        assert_eq!(Config::default().gcp.zone, "us-central1-a");
    }

    #[test]
    fn match_policy_parsing() {
        assert_eq!("fanout".parse::<MatchPolicy>().unwrap(), MatchPolicy::FanOut);
        assert_eq!("Exactly-One".parse::<MatchPolicy>().unwrap(), MatchPolicy::ExactlyOne);
        assert!("sometimes".parse::<MatchPolicy>().is_err());
    }

    #[test]
    fn server_validation_requires_secret_and_instance() {
        assert!(server_ready().validate_for_server().is_ok());

        let mut config = server_ready();
        config.auth.secret.clear();
        assert!(matches!(config.validate_for_server(), Err(crate::Error::Config(_))));

        let mut config = server_ready();
        config.instance.identifier.clear();
        assert!(config.validate_for_server().is_err());
    }

    #[test]
    fn provision_validation_checks_alert_windows() {
        let mut config = server_ready();
        assert!(config.validate_for_provision().is_ok());

        config.provision.alert.alignment_period_secs = 3600;
        assert!(config.validate_for_provision().is_err());

        let mut config = server_ready();
        config.provision.boot_image = "ubuntu".into();
        assert!(config.validate_for_provision().is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut config = server_ready();
        config.gcp.access_token = Some("ya29.secret".into());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("SECRET"));
        assert!(!rendered.contains("ya29.secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
