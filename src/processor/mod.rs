//! Stream processor: lifecycle, consume loop and commit gating

pub mod config;

mod builder;
mod completion;
mod engine;
mod offsets;

use serde::Serialize;

use crate::error::ProcessorError;
use crate::gap::SubscriptionTopicGap;

pub use builder::ProcessorBuilder;
pub use config::{
    ConnectionSettings, OffsetReset, OutputTopic, ProcessorOptions, SaslMechanism,
    SecurityProtocol, ALLOWED_CLIENT_PROPERTIES,
};
pub use engine::Processor;

/// Lifecycle state of a [`Processor`]
///
/// A new processor starts `Terminated`; once it has been activated and
/// terminated again it stays `Terminated` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorStatus {
    Activated,
    Terminating,
    Terminated,
}

impl std::fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessorStatus::Activated => "activated",
            ProcessorStatus::Terminating => "terminating",
            ProcessorStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Invoked once after the processor reached [`ProcessorStatus::Terminated`]
///
/// Receives the final gaps and the termination error, if any. A panic inside
/// the callback is logged and swallowed.
pub type OnTerminated =
    Box<dyn FnOnce(&Processor, &[SubscriptionTopicGap], Option<&ProcessorError>) + Send>;
