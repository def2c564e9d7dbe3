#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod desired;
pub mod orphan;
pub mod pipeline;
pub mod wait;


pub use self::{
    cluster::{Cluster, ClusterError, KubeCluster, ObjectRef, Scope},
    desired::{NodeRef, Rendered},
    orphan::{Disposition, OrphanReason},
    pipeline::{Attempt, Cleanup, Conflict, Notice, PassReport, Pipeline, Settle, Severity},
    wait::{wait_for_ready, WaitError},
};
