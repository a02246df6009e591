pub mod pubsub;

pub use pubsub::{AlertNotification, Incident, ShutdownHandler, ShutdownOutcome, SkipReason};
