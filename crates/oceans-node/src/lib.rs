//! # Oceans Node
//!
//! Runs the incentive pipeline epoch by epoch: the coordinator state
//! machine, publication with retry and confirmation, the periodic driver,
//! configuration, metrics and audit replay.

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod metrics;
pub mod node;
pub mod publisher;
pub mod replay;

pub use config::NodeConfig;
pub use coordinator::{CoordinatorConfig, EpochCoordinator, Sources};
pub use driver::{DriverEvent, DriverStats, EpochClock, EpochDriver, EpochRunner, EpochWindow};
pub use metrics::{MetricsServer, OceansMetrics};
pub use node::OceansNode;
pub use publisher::{
    ConfirmationPolicy, LocalPublisher, PublishAck, PublishReport, PublishedVector, Publisher,
    RetryPolicy,
};
pub use replay::{verify, ReplayReport, RewardCheck, WeightCheck};
