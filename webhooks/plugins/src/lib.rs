//! Decision plugins bundled with the webhooks manager.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod affinity;
pub mod ingress;
pub mod jive;

#[cfg(test)]
mod test_util;

pub use self::{affinity::DeploymentAffinity, ingress::RewriteTarget, jive::WebAppAffinity};

use webhooks_manager_core::{AddOperation, PatchOperation, PointerBuf};
use webhooks_manager_k8s_api::ObjectMeta;

/// The annotation recording that a plugin rewrote an object's affinity.
const AFFINITY_ANNOTATION: &str = "mutatingWebookAffinity";

/// Sets an annotation, creating the annotations map if the object has none.
fn annotate(meta: &ObjectMeta, key: &str, value: &str) -> PatchOperation {
    let op = if meta.annotations.is_none() {
        AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::json!({ key: value }),
        }
    } else {
        AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations", key]),
            value: serde_json::Value::String(value.to_string()),
        }
    };
    PatchOperation::Add(op)
}
