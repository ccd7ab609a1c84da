use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use webhooks_manager_core::{
    decode_object, patch_response, AdmissionRequest, AdmissionResponse, PatchOperation, Plugin,
    PointerBuf, ReplaceOperation, Setup,
};
use webhooks_manager_k8s_api::Ingress;

pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// Paths rewritten to capture groups must not be interpreted as prefixes.
const REGEX_PATH_TYPE: &str = "ImplementationSpecific";

/// Upgrades plain `rewrite-target` annotations to the capture-group form
/// required by newer ingress-nginx releases.
#[derive(Clone, Debug, Default)]
pub struct RewriteTarget {
    _p: (),
}

impl Plugin for RewriteTarget {
    fn name(&self) -> &'static str {
        "ingress-rewrite-target"
    }

    fn setup(&self, server: &mut dyn Setup, path: &str) -> Result<()> {
        server.register_handler(path, Arc::new(admit))?;
        Ok(())
    }
}

fn admit(req: &AdmissionRequest) -> Result<AdmissionResponse> {
    let rsp = AdmissionResponse::from(req);
    if req.kind.kind != "Ingress" {
        return Ok(rsp);
    }
    let ops = rewrite(decode_object(req)?)?;
    if !ops.is_empty() {
        let ns = req.namespace.as_deref().unwrap_or_default();
        info!(%ns, name = %req.name, "Rewriting ingress target");
    }
    patch_response(rsp, ops)
}

fn rewrite(mut ingress: Ingress) -> Result<Vec<PatchOperation>> {
    let mut annotations = ingress.metadata.annotations.take().unwrap_or_default();
    let Some(target) = annotations.get(REWRITE_TARGET_ANNOTATION).cloned() else {
        return Ok(vec![]);
    };
    if target.contains('$') {
        return Ok(vec![]);
    }

    // The annotation is only dropped when every path is the root path being
    // rewritten to the root.
    let mut drop_annotation = true;
    let mut rules = ingress
        .spec
        .take()
        .and_then(|spec| spec.rules)
        .unwrap_or_default();
    for path in rules
        .iter_mut()
        .filter_map(|rule| rule.http.as_mut())
        .flat_map(|http| http.paths.iter_mut())
    {
        if target == "/" && path.path.as_deref() == Some("/") {
            continue;
        }
        drop_annotation = false;
        let mut rewritten = path.path.take().unwrap_or_default();
        if !rewritten.ends_with('/') {
            rewritten.push('/');
        }
        rewritten.push_str("?(.*)");
        path.path = Some(rewritten);
        path.path_type = REGEX_PATH_TYPE.to_string();
    }

    if drop_annotation {
        annotations.remove(REWRITE_TARGET_ANNOTATION);
        return Ok(vec![replace(
            ["metadata", "annotations"],
            serde_json::to_value(annotations)?,
        )]);
    }

    let mut target = target;
    if !target.ends_with('/') {
        target.push('/');
    }
    target.push_str("$1");
    annotations.insert(REWRITE_TARGET_ANNOTATION.to_string(), target);
    Ok(vec![
        replace(["metadata", "annotations"], serde_json::to_value(annotations)?),
        replace(["spec", "rules"], serde_json::to_value(rules)?),
    ])
}

fn replace<const N: usize>(tokens: [&str; N], value: serde_json::Value) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation {
        path: PointerBuf::from_tokens(tokens),
        value,
    })
}
