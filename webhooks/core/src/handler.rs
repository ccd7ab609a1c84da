use crate::{AdmissionRequest, AdmissionResponse};
use anyhow::{anyhow, Context, Result};
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde::de::DeserializeOwned;

/// A decision plugin's entry point.
///
/// Handlers run on the request path. They may read from informer caches and
/// the shared configuration but must not call the API server. An error is
/// reported to the API server as a denial carrying the error's message.
pub trait Handler: Send + Sync + 'static {
    fn admit(&self, req: &AdmissionRequest) -> Result<AdmissionResponse>;
}

/// Allows every request unchanged.
#[derive(Copy, Clone, Debug, Default)]
pub struct AdmitAlways;

/// Denies every request.
#[derive(Copy, Clone, Debug, Default)]
pub struct AdmitNever;

impl<F> Handler for F
where
    F: Fn(&AdmissionRequest) -> Result<AdmissionResponse> + Send + Sync + 'static,
{
    fn admit(&self, req: &AdmissionRequest) -> Result<AdmissionResponse> {
        (self)(req)
    }
}

impl Handler for AdmitAlways {
    fn admit(&self, req: &AdmissionRequest) -> Result<AdmissionResponse> {
        Ok(AdmissionResponse::from(req))
    }
}

impl Handler for AdmitNever {
    fn admit(&self, req: &AdmissionRequest) -> Result<AdmissionResponse> {
        let mut rsp = AdmissionResponse::from(req);
        rsp.allowed = false;
        Ok(rsp)
    }
}

/// Decodes the request's target object as `K`.
pub fn decode_object<K: DeserializeOwned>(req: &AdmissionRequest) -> Result<K> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).with_context(|| format!("failed to decode {} object", req.kind.kind))
}

/// Attaches `ops` to `rsp` as a JSON patch. The API server distinguishes an
/// absent patch from an empty one, so an empty list leaves `rsp` unpatched.
pub fn patch_response(rsp: AdmissionResponse, ops: Vec<PatchOperation>) -> Result<AdmissionResponse> {
    if ops.is_empty() {
        return Ok(rsp);
    }
    Ok(rsp.with_patch(Patch(ops))?)
}

/// Sets `value` at `path`, choosing `add` when nothing is present there and
/// `replace` otherwise.
pub fn set(path: PointerBuf, present: bool, value: serde_json::Value) -> PatchOperation {
    if present {
        PatchOperation::Replace(ReplaceOperation { path, value })
    } else {
        PatchOperation::Add(AddOperation { path, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mk_request(object: serde_json::Value) -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
            "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
            "namespace": "default",
            "name": "web",
            "operation": "CREATE",
            "userInfo": {"username": "admin"},
            "object": object,
        }))
        .expect("request must decode")
    }

    #[test]
    fn decodes_typed_objects() {
        let req = mk_request(json!({
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "spec": {"replicas": 3},
        }));
        let obj = decode_object::<serde_json::Value>(&req).unwrap();
        assert_eq!(obj["spec"]["replicas"], 3);
        assert_eq!(obj["metadata"]["labels"]["app"], "web");

        let req = mk_request(json!({"metadata": {}, "spec": {"replicas": "many"}}));
        let error = decode_object::<webhooks_manager_k8s_api::Deployment>(&req).err().expect("decode must fail");
        assert_eq!(error.to_string(), "failed to decode Deployment object");
    }

    #[test]
    fn empty_patch_is_omitted() {
        let req = mk_request(json!({"metadata": {}}));
        let rsp = patch_response(AdmissionResponse::from(&req), vec![]).unwrap();
        let value = serde_json::to_value(&rsp).unwrap();
        assert!(value.get("patch").is_none());
        assert!(value.get("patchType").is_none());
    }

    #[test]
    fn patches_are_tagged_json_patch() {
        let req = mk_request(json!({"metadata": {}}));
        let op = set(
            PointerBuf::from_tokens(["metadata", "labels"]),
            false,
            json!({"a": "b"}),
        );
        let rsp = patch_response(AdmissionResponse::from(&req), vec![op]).unwrap();
        let value = serde_json::to_value(&rsp).unwrap();
        assert_eq!(value["patchType"], "JSONPatch");
        assert!(value["patch"].is_string());
    }

    #[test]
    fn set_selects_add_or_replace() {
        let path = PointerBuf::from_tokens(["spec", "affinity"]);
        assert!(matches!(
            set(path.clone(), false, json!({})),
            PatchOperation::Add(_)
        ));
        assert!(matches!(
            set(path, true, json!({})),
            PatchOperation::Replace(_)
        ));
    }

    #[test]
    fn fallbacks_decide_without_reading_the_object() {
        let req = mk_request(json!({"metadata": {}}));
        assert!(AdmitAlways.admit(&req).unwrap().allowed);
        let rsp = AdmitNever.admit(&req).unwrap();
        assert!(!rsp.allowed);
        assert_eq!(rsp.uid, req.uid);
    }
}
