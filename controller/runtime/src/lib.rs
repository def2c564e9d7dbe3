#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use lynq_controller_core as core;
pub use lynq_controller_k8s_api as k8s;
pub use lynq_controller_k8s_apply as apply;
pub use lynq_controller_k8s_status as status;

mod admission;
mod args;
mod backoff;
mod error;
mod form;
mod lease;
mod node;
mod validation;

pub use self::{args::Args, error::Error};
