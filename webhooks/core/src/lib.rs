#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
mod handler;
mod plugin;

pub use self::{
    config::{Config, ConfigWriter, DefaultPolicy, SharedConfig},
    handler::{decode_object, patch_response, set, AdmitAlways, AdmitNever, Handler},
    plugin::{DuplicatePath, Plugin, Setup},
};
pub use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation};
pub use jsonptr::PointerBuf;
pub use kube::core::admission::{AdmissionResponse, Operation};

pub type AdmissionRequest = kube::core::admission::AdmissionRequest<kube::core::DynamicObject>;
pub type AdmissionReview = kube::core::admission::AdmissionReview<kube::core::DynamicObject>;

/// The name under which the cluster-wide informer cache is shared between
/// the configuration store and plugins.
pub const KUBERNETES_FACTORY: &str = "kubernetes";

/// The component name attached to audit events and field managers.
pub const COMPONENT_NAME: &str = "webhooks-manager";
