//! Spreads the replicas of larger deployments across zones.
//!
//! Deployments with at least `minimumReplicasForAffinity` replicas, and pods
//! whose owning ReplicaSet belongs to such a deployment, get a preferred pod
//! anti-affinity term on the deployment's template labels.

use crate::{annotate, AFFINITY_ANNOTATION};
use anyhow::Result;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};
use webhooks_manager_core::{
    decode_object, patch_response, set, AdmissionRequest, AdmissionResponse, Handler,
    PatchOperation, Plugin, PointerBuf, Setup, SharedConfig, KUBERNETES_FACTORY,
};
use webhooks_manager_k8s_api::{
    Affinity, Deployment, LabelSelector, ObjectMeta, OwnerReference, Pod, PodAffinityTerm,
    PodAntiAffinity, ReplicaSet, WeightedPodAffinityTerm,
};
use webhooks_manager_k8s_cache::Store;

pub const MINIMUM_REPLICAS_KEY: &str = "minimumReplicasForAffinity";
pub const WEIGHT_KEY: &str = "weightForAffinity";
pub const TOPOLOGY_KEY: &str = "topologyKeyForAffinity";

const DEFAULT_MINIMUM_REPLICAS: i32 = 3;
const DEFAULT_WEIGHT: i32 = 100;
const DEFAULT_TOPOLOGY_KEY: &str = "failure-domain.beta.kubernetes.io/zone";

#[derive(Clone, Debug, Default)]
pub struct DeploymentAffinity {
    _p: (),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Settings {
    minimum_replicas: i32,
    weight: i32,
    topology_key: String,
}

struct Admit {
    replica_sets: Store<ReplicaSet>,
    deployments: Store<Deployment>,
    config: SharedConfig,
}

// === impl DeploymentAffinity ===

impl Plugin for DeploymentAffinity {
    fn name(&self) -> &'static str {
        "deployment-affinity"
    }

    fn setup(&self, server: &mut dyn Setup, path: &str) -> Result<()> {
        let informers = server.factory_or_register(KUBERNETES_FACTORY);
        let admit = Admit {
            replica_sets: informers.store(),
            deployments: informers.store(),
            config: server.config(),
        };
        server.register_handler(path, Arc::new(admit))?;
        Ok(())
    }
}

// === impl Settings ===

impl Default for Settings {
    fn default() -> Self {
        Self {
            minimum_replicas: DEFAULT_MINIMUM_REPLICAS,
            weight: DEFAULT_WEIGHT,
            topology_key: DEFAULT_TOPOLOGY_KEY.to_string(),
        }
    }
}

impl Settings {
    fn from_data(data: &BTreeMap<String, String>) -> Self {
        let defaults = Self::default();
        let int = |key: &str, default: i32| {
            data.get(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            minimum_replicas: int(MINIMUM_REPLICAS_KEY, defaults.minimum_replicas),
            weight: int(WEIGHT_KEY, defaults.weight),
            topology_key: data
                .get(TOPOLOGY_KEY)
                .cloned()
                .unwrap_or(defaults.topology_key),
        }
    }

    /// Adds a preferred anti-affinity term to `existing`, or returns `None`
    /// when a pod anti-affinity is already configured.
    fn affinity_patch(
        &self,
        path: PointerBuf,
        existing: Option<&Affinity>,
        labels: BTreeMap<String, String>,
    ) -> Result<Option<PatchOperation>> {
        let anti_affinity = PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: self.weight,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(labels),
                            ..Default::default()
                        }),
                        topology_key: self.topology_key.clone(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        };

        let affinity = match existing {
            None => Affinity {
                pod_anti_affinity: Some(anti_affinity),
                ..Default::default()
            },
            Some(affinity) if affinity.pod_anti_affinity.is_none() => Affinity {
                pod_anti_affinity: Some(anti_affinity),
                ..affinity.clone()
            },
            Some(_) => return Ok(None),
        };
        Ok(Some(set(
            path,
            existing.is_some(),
            serde_json::to_value(affinity)?,
        )))
    }
}

// === impl Admit ===

impl Handler for Admit {
    fn admit(&self, req: &AdmissionRequest) -> Result<AdmissionResponse> {
        let rsp = AdmissionResponse::from(req);
        let settings = Settings::from_data(&self.config.get().data);
        let ops = match req.kind.kind.as_str() {
            "Deployment" => deployment_patch(&settings, decode_object(req)?)?,
            "Pod" => self.pod_patch(&settings, decode_object(req)?)?,
            _ => return Ok(rsp),
        };
        if !ops.is_empty() {
            let ns = req.namespace.as_deref().unwrap_or_default();
            info!(kind = %req.kind.kind, %ns, name = %req.name, "Spreading replicas across zones");
        }
        patch_response(rsp, ops)
    }
}

impl Admit {
    fn pod_patch(&self, settings: &Settings, pod: Pod) -> Result<Vec<PatchOperation>> {
        let Some(deployment) = self.owning_deployment(&pod) else {
            debug!("Pod is not owned by a known deployment");
            return Ok(vec![]);
        };
        let Some(spec) = deployment.spec.as_ref() else {
            return Ok(vec![]);
        };
        if spec.replicas.unwrap_or(1) < settings.minimum_replicas {
            return Ok(vec![]);
        }
        let Some(pod_spec) = pod.spec.as_ref() else {
            return Ok(vec![]);
        };

        let labels = template_labels(&deployment);
        let Some(op) = settings.affinity_patch(
            PointerBuf::from_tokens(["spec", "affinity"]),
            pod_spec.affinity.as_ref(),
            labels,
        )?
        else {
            return Ok(vec![]);
        };
        Ok(vec![
            op,
            annotate(
                &pod.metadata,
                AFFINITY_ANNOTATION,
                "Pod Affinity updated to spread across AZs",
            ),
        ])
    }

    /// Follows the pod's sole ReplicaSet owner to its sole Deployment owner,
    /// both resolved by UID from the caches.
    fn owning_deployment(&self, pod: &Pod) -> Option<Arc<Deployment>> {
        let owner = sole_owner(&pod.metadata, "ReplicaSet")?;
        let rs = self
            .replica_sets
            .find(|rs| rs.metadata.uid.as_deref() == Some(owner.uid.as_str()))?;
        let owner = sole_owner(&rs.metadata, "Deployment")?;
        self.deployments
            .find(|d| d.metadata.uid.as_deref() == Some(owner.uid.as_str()))
    }
}

fn deployment_patch(settings: &Settings, deployment: Deployment) -> Result<Vec<PatchOperation>> {
    let Some(spec) = deployment.spec.as_ref() else {
        return Ok(vec![]);
    };
    if spec.replicas.unwrap_or(1) < settings.minimum_replicas {
        debug!(replicas = ?spec.replicas, "Too few replicas to spread");
        return Ok(vec![]);
    }
    let Some(pod_spec) = spec.template.spec.as_ref() else {
        return Ok(vec![]);
    };

    let labels = template_labels(&deployment);
    let Some(op) = settings.affinity_patch(
        PointerBuf::from_tokens(["spec", "template", "spec", "affinity"]),
        pod_spec.affinity.as_ref(),
        labels,
    )?
    else {
        return Ok(vec![]);
    };
    Ok(vec![
        op,
        annotate(
            &deployment.metadata,
            AFFINITY_ANNOTATION,
            "Deployment Affinity updated to spread across AZs",
        ),
    ])
}

fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}

fn sole_owner<'m>(meta: &'m ObjectMeta, kind: &str) -> Option<&'m OwnerReference> {
    match meta.owner_references.as_deref() {
        Some([owner]) if owner.kind == kind => Some(owner),
        _ => None,
    }
}
