#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod events;
mod metrics;
mod patch;
mod retry;

pub use self::{
    events::{KubeEvents, NoEvents, Publish},
    metrics::{FormMetrics, NodeMetrics},
    patch::patch_status,
    retry::{is_conflict, RetryPolicy},
};
pub use kube::runtime::events::EventType;
