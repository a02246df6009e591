use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{locate, ComputeApi, InstanceRef, PowerAction};
use crate::{config::MatchPolicy, metrics, Error, Result};

/// Starts and stops the instance(s) behind an identifier and waits for the
/// provider operations to finish.
#[derive(Clone)]
pub struct InstanceController {
    compute: Arc<dyn ComputeApi>,
    policy: MatchPolicy,
}

impl InstanceController {
    pub fn new(compute: Arc<dyn ComputeApi>, policy: MatchPolicy) -> Self {
        Self { compute, policy }
    }

    /// Start every matched instance. Returns how many were started.
    pub async fn start(&self, identifier: &str) -> Result<usize> {
        self.transition(identifier, PowerAction::Start).await
    }

    /// Stop every matched instance. Returns how many were stopped.
    pub async fn stop(&self, identifier: &str) -> Result<usize> {
        self.transition(identifier, PowerAction::Stop).await
    }

    async fn transition(&self, identifier: &str, action: PowerAction) -> Result<usize> {
        let instances = locate(self.compute.as_ref(), identifier).await?;
        self.check_policy(identifier, &instances)?;

        if instances.is_empty() {
            warn!("No instance matches '{}', nothing to {}", identifier, action);
            return Ok(0);
        }

        info!(
            "Issuing {} for {} instance(s) matching '{}'",
            action,
            instances.len(),
            identifier
        );

        // Every operation is awaited even when one fails early
        let results = join_all(instances.iter().map(|instance| self.run(instance, action))).await;
        let completed = results.len();
        results.into_iter().collect::<Result<Vec<()>>>()?;

        Ok(completed)
    }

    async fn run(&self, instance: &InstanceRef, action: PowerAction) -> Result<()> {
        let result = self.issue_and_wait(instance, action).await;
        match &result {
            Ok(()) => {
                info!("{} of {} ({}) completed", action, instance.name, instance.zone);
                metrics::INSTANCE_OPERATIONS_TOTAL
                    .with_label_values(&[action.as_str(), "success"])
                    .inc();
            }
            Err(e) => {
                error!("{} of {} ({}) failed: {}", action, instance.name, instance.zone, e);
                metrics::INSTANCE_OPERATIONS_TOTAL
                    .with_label_values(&[action.as_str(), "failure"])
                    .inc();
            }
        }
        result
    }

    async fn issue_and_wait(&self, instance: &InstanceRef, action: PowerAction) -> Result<()> {
        let operation = match action {
            PowerAction::Start => self.compute.start_instance(instance).await?,
            PowerAction::Stop => self.compute.stop_instance(instance).await?,
        };
        self.compute.wait_for_operation(&operation).await?.into_result()?;
        Ok(())
    }

    fn check_policy(&self, identifier: &str, instances: &[InstanceRef]) -> Result<()> {
        match (self.policy, instances.len()) {
            (MatchPolicy::FanOut, _) | (MatchPolicy::ExactlyOne, 1) => Ok(()),
            (MatchPolicy::ExactlyOne, 0) => Err(Error::NotFound(format!(
                "no instance matches '{}'",
                identifier
            ))),
            (MatchPolicy::ExactlyOne, n) => Err(Error::Ambiguous(format!(
                "{} instances match '{}'",
                n, identifier
            ))),
        }
    }
}
