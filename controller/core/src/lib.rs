#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Cluster-independent building blocks of the lynq controller: dependency
//! ordering, per-pass resource state, rollout accounting, and the small
//! collaborators (rendering, readiness, ignored field paths) the reconcilers
//! call into.

pub mod applied;
pub mod fieldpath;
pub mod graph;
pub mod outcome;
pub mod readiness;
pub mod rollout;
pub mod template;

pub use self::{
    applied::AppliedResource,
    fieldpath::FieldPath,
    graph::{DependencyGraph, GraphError},
    outcome::{FailureReason, Gate, Pass, ResourceState, Summary},
    rollout::{NodeRollout, RolloutPhase, RolloutState, RolloutStats, Throttle},
    template::{Engine, NodeVariables, Render, RenderError, Variables},
};
