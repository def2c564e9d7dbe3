#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod condition;
pub mod form;
pub mod labels;
pub mod node;
pub mod resources;

pub use self::{
    condition::{Condition, ConditionStatus},
    form::{LynqForm, LynqFormSpec, LynqFormStatus, RolloutConfig},
    labels::Tracking,
    node::{LynqNode, LynqNodeSpec, LynqNodeStatus},
    resources::{
        ConflictPolicy, CreationPolicy, Declared, DeletionPolicy, PatchStrategy, Resources,
        TResource,
    },
};
pub use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::api::{DynamicObject, ObjectMeta, ResourceExt};

/// The finalizer that gates node deletion on resource cleanup.
pub const NODE_FINALIZER: &str = "lynqnode.operator.lynq.sh/finalizer";
