//! Construction order for the provisioned resources.
//!
//! Each step names the steps whose outputs it consumes. The plan is sorted
//! topologically (Kahn's algorithm, ties broken by declaration order) so the
//! applier can walk it front to back and always find its inputs.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::{config::ProvisionConfig, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Project,
    Network,
    Firewall,
    Instance,
    Topic,
    TopicIam,
    NotificationChannel,
    AlertPolicy,
    PushSubscription,
}

impl StepKind {
    pub fn dependencies(&self) -> &'static [StepKind] {
        use StepKind::*;
        match self {
            Project | Network | Topic => &[],
            Firewall => &[Network],
            Instance => &[Network, Firewall],
            TopicIam => &[Topic, Project],
            NotificationChannel => &[Topic, TopicIam],
            AlertPolicy => &[NotificationChannel, Instance],
            PushSubscription => &[Topic],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Project => "project",
            StepKind::Network => "network",
            StepKind::Firewall => "firewall",
            StepKind::Instance => "instance",
            StepKind::Topic => "topic",
            StepKind::TopicIam => "topic-iam",
            StepKind::NotificationChannel => "notification-channel",
            StepKind::AlertPolicy => "alert-policy",
            StepKind::PushSubscription => "push-subscription",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub kind: StepKind,
    pub depends_on: Vec<StepKind>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            depends_on: kind.dependencies().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// Every step the configuration asks for.
    pub fn for_config(config: &ProvisionConfig) -> Result<Self> {
        let mut kinds = vec![
            StepKind::Network,
            StepKind::Firewall,
            StepKind::Instance,
            StepKind::Topic,
            StepKind::Project,
            StepKind::TopicIam,
            StepKind::NotificationChannel,
            StepKind::AlertPolicy,
        ];
        if config.push_endpoint.is_some() {
            kinds.push(StepKind::PushSubscription);
        }
        Self::from_steps(kinds.into_iter().map(Step::new).collect())
    }

    /// Order arbitrary steps, rejecting duplicates, dangling dependencies and cycles.
    pub fn from_steps(declared: Vec<Step>) -> Result<Self> {
        let mut index: HashMap<StepKind, usize> = HashMap::new();
        for (i, step) in declared.iter().enumerate() {
            if index.insert(step.kind, i).is_some() {
                return Err(Error::Validation(format!("step {} declared twice", step.kind)));
            }
        }

        let mut remaining: Vec<usize> = vec![0; declared.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); declared.len()];
        for (i, step) in declared.iter().enumerate() {
            for dep in &step.depends_on {
                let d = *index.get(dep).ok_or_else(|| {
                    Error::Validation(format!("step {} depends on undeclared step {}", step.kind, dep))
                })?;
                remaining[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..declared.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(declared.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &dependents[i] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != declared.len() {
            let stuck: Vec<String> = (0..declared.len())
                .filter(|i| !order.contains(i))
                .map(|i| declared[i].kind.to_string())
                .collect();
            return Err(Error::Validation(format!(
                "dependency cycle between steps: {}",
                stuck.join(", ")
            )));
        }

        let mut slots: Vec<Option<Step>> = declared.into_iter().map(Some).collect();
        let steps = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn position(&self, kind: StepKind) -> Option<usize> {
        self.steps.iter().position(|s| s.kind == kind)
    }
}
