use kube::runtime::{reflector::store::Writer, watcher};
use serde::Serialize;
use std::collections::BTreeMap;
use webhooks_manager_core::{AdmissionRequest, AdmissionResponse, Config, SharedConfig};
use webhooks_manager_k8s_api::Resource;
use webhooks_manager_k8s_cache::Store;

pub fn mk_request(kind: &str, ns: &str, obj: impl Serialize) -> AdmissionRequest {
    let mut object = serde_json::to_value(obj).expect("object must serialize");
    if object.get("metadata").is_none() {
        object["metadata"] = serde_json::json!({});
    }
    let name = object
        .pointer("/metadata/name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(serde_json::json!({
        "uid": "7b3e9f52-1c0e-4a8b-9f0d-2d6a1c3b4e5f",
        "kind": {"group": "", "version": "v1", "kind": kind},
        "resource": {"group": "", "version": "v1", "resource": kind.to_lowercase()},
        "namespace": ns,
        "name": name,
        "operation": "CREATE",
        "userInfo": {"username": "system:admin"},
        "object": object,
    }))
    .expect("request must decode")
}

pub fn mk_store<K>(objs: impl IntoIterator<Item = K>) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    let mut writer = Writer::default();
    for obj in objs {
        writer.apply_watcher_event(&watcher::Event::Apply(obj));
    }
    writer.as_reader()
}

pub fn mk_config(data: BTreeMap<String, String>) -> SharedConfig {
    SharedConfig::fixed(Config {
        data,
        ..Default::default()
    })
}

/// Decodes the response's patch, if any.
pub fn patch_of(rsp: &AdmissionResponse) -> Option<json_patch::Patch> {
    let bytes = rsp.patch.as_ref()?;
    Some(serde_json::from_slice(bytes).expect("patch must be a JSON patch"))
}

/// The `(op, path)` pairs of the response's patch.
pub fn ops(rsp: &AdmissionResponse) -> Vec<(String, String)> {
    let Some(patch) = patch_of(rsp) else {
        return vec![];
    };
    let ops = serde_json::to_value(&patch).expect("patch must serialize");
    ops.as_array()
        .expect("patch must be an array")
        .iter()
        .map(|op| {
            (
                op["op"].as_str().unwrap_or_default().to_string(),
                op["path"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Applies the response's patch to `obj`.
pub fn apply(obj: impl Serialize, rsp: &AdmissionResponse) -> serde_json::Value {
    let mut doc = serde_json::to_value(obj).expect("object must serialize");
    if let Some(patch) = patch_of(rsp) {
        json_patch::patch(&mut doc, &patch.0).expect("patch must apply");
    }
    doc
}
