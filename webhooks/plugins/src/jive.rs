//! Forces web-app replicas of small installations onto distinct nodes.
//!
//! Workloads qualify when their namespace's labels match the configured
//! namespace selector and the namespace's web-app HPA is capped at a small
//! number of replicas. Every decision is taken from the informer caches.

use crate::{annotate, AFFINITY_ANNOTATION};
use anyhow::Result;
use arc_swap::ArcSwapOption;
use serde_yaml::Value;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use webhooks_manager_core::{
    decode_object, patch_response, set, AdmissionRequest, AdmissionResponse, Config, Handler,
    Plugin, PointerBuf, Setup, SharedConfig, KUBERNETES_FACTORY,
};
use webhooks_manager_k8s_api::{
    Affinity, Deployment, HorizontalPodAutoscaler, LabelSelector, Labels, Namespace, ObjectRef,
    Pod, PodAffinityTerm, PodSpec, Selector,
};
use webhooks_manager_k8s_cache::Store;

/// The ConfigMap key holding this plugin's YAML settings.
pub const CONFIG_KEY: &str = "jiveWebAppsAffinity";

const DEFAULT_MAXIMUM_HPA_REPLICAS: i32 = 10;
const DEFAULT_HPA_NAME: &str = "webapp-hpa";
const DEFAULT_POD_LABEL: &str = "jcx.inst.uri";
const DEFAULT_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const DEFAULT_NS_SELECTOR: &str =
    "jcx.customer.id,jcx.environment,jcx.inst.uri,jcx.name,jcx.suspended=false";
const DEFAULT_HPA_SELECTOR: &str = "jcx.environment";

#[derive(Clone, Debug, Default)]
pub struct WebAppAffinity {
    _p: (),
}

#[derive(Clone, Debug)]
struct Settings {
    maximum_hpa_replicas: i32,
    hpa_name: String,
    pod_label: String,
    topology_key: String,
    ns_selector: Selector,
    hpa_selector: Selector,
    ns_prefix: String,
}

struct Admit {
    namespaces: Store<Namespace>,
    hpas: Store<HorizontalPodAutoscaler>,
    config: SharedConfig,
    settings: ArcSwapOption<Memo>,
}

/// Settings parsed from a configuration snapshot.
struct Memo {
    config: Arc<Config>,
    settings: Arc<Settings>,
}

/// Why a workload is left unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
enum Skip {
    #[error("namespace {0} lacks prefix {1:?}")]
    NamespacePrefix(String, String),

    #[error("workload has no {0} label")]
    MissingLabel(String),

    #[error("namespace {0} is not cached")]
    UnknownNamespace(String),

    #[error("namespace {0} does not match the namespace selector")]
    NamespaceMismatch(String),

    #[error("{0}/{1} is not cached")]
    UnknownHpa(String, String),

    #[error("{0}/{1} does not match the HPA selector")]
    HpaMismatch(String, String),

    #[error("HPA allows up to {0} replicas")]
    TooManyReplicas(i32),

    #[error("a required anti-affinity on {0} is already set")]
    AlreadySet(String),
}

// === impl WebAppAffinity ===

impl Plugin for WebAppAffinity {
    fn name(&self) -> &'static str {
        "jive-webapps-affinity"
    }

    fn setup(&self, server: &mut dyn Setup, path: &str) -> Result<()> {
        let informers = server.factory_or_register(KUBERNETES_FACTORY);
        let admit = Admit::new(informers.store(), informers.store(), server.config());
        server.register_handler(path, Arc::new(admit))?;
        Ok(())
    }
}

// === impl Settings ===

impl Default for Settings {
    fn default() -> Self {
        Self {
            maximum_hpa_replicas: DEFAULT_MAXIMUM_HPA_REPLICAS,
            hpa_name: DEFAULT_HPA_NAME.to_string(),
            pod_label: DEFAULT_POD_LABEL.to_string(),
            topology_key: DEFAULT_TOPOLOGY_KEY.to_string(),
            ns_selector: DEFAULT_NS_SELECTOR
                .parse()
                .expect("default namespace selector must be valid"),
            hpa_selector: DEFAULT_HPA_SELECTOR
                .parse()
                .expect("default HPA selector must be valid"),
            ns_prefix: String::new(),
        }
    }
}

impl Settings {
    /// Parses the YAML settings document. Missing or mistyped fields keep
    /// their defaults.
    fn from_yaml(yaml: Option<&str>) -> Self {
        let mut settings = Self::default();
        let Some(yaml) = yaml else {
            return settings;
        };
        let conf = match serde_yaml::from_str::<Value>(yaml) {
            Ok(Value::Mapping(conf)) => conf,
            Ok(_) => {
                warn!("Ignoring non-mapping {CONFIG_KEY} settings");
                return settings;
            }
            Err(error) => {
                warn!(%error, "Ignoring unparseable {CONFIG_KEY} settings");
                return settings;
            }
        };
        let string = |key: &str| match conf.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };

        if let Some(max) = match conf.get("maximumHpaReplicas") {
            Some(Value::Number(n)) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        } {
            settings.maximum_hpa_replicas = max;
        }
        if let Some(name) = string("hpaName") {
            settings.hpa_name = name;
        }
        if let Some(label) = string("podLabelForAffinity") {
            settings.pod_label = label;
        }
        if let Some(key) = string("topologyKey") {
            settings.topology_key = key;
        }
        if let Some(prefix) = string("nsPrefix") {
            settings.ns_prefix = prefix;
        }
        if let Some(sel) = string("nsLabelSelStr") {
            match sel.parse() {
                Ok(sel) => settings.ns_selector = sel,
                Err(error) => {
                    warn!(%error, selector = %sel, "Invalid namespace selector; using {DEFAULT_NS_SELECTOR}")
                }
            }
        }
        if let Some(sel) = string("hpaLabelSelStr") {
            match sel.parse() {
                Ok(sel) => settings.hpa_selector = sel,
                Err(error) => {
                    warn!(%error, selector = %sel, "Invalid HPA selector; using {DEFAULT_HPA_SELECTOR}")
                }
            }
        }
        settings
    }
}

// === impl Admit ===

impl Handler for Admit {
    fn admit(&self, req: &AdmissionRequest) -> Result<AdmissionResponse> {
        let rsp = AdmissionResponse::from(req);
        let settings = self.settings();
        let ns = req.namespace.as_deref().unwrap_or_default();

        let (path, annotation, meta, labels, spec) = match req.kind.kind.as_str() {
            "Deployment" => {
                let deployment = decode_object::<Deployment>(req)?;
                let Some(template) = deployment.spec.map(|s| s.template) else {
                    return Ok(rsp);
                };
                (
                    PointerBuf::from_tokens(["spec", "template", "spec", "affinity"]),
                    "Deployment Affinity updated to spread across Nodes",
                    deployment.metadata,
                    template.metadata.and_then(|m| m.labels),
                    template.spec,
                )
            }
            "Pod" => {
                let pod = decode_object::<Pod>(req)?;
                let labels = pod.metadata.labels.clone();
                (
                    PointerBuf::from_tokens(["spec", "affinity"]),
                    "Pod Affinity updated to spread across Nodes",
                    pod.metadata,
                    labels,
                    pod.spec,
                )
            }
            _ => return Ok(rsp),
        };
        let Some(spec) = spec else {
            return Ok(rsp);
        };

        let (present, affinity) = match self.affinity_for(&settings, ns, labels.as_ref(), &spec) {
            Ok(update) => update,
            Err(skip) => {
                debug!(%skip, "Leaving workload unchanged");
                return Ok(rsp);
            }
        };
        info!(kind = %req.kind.kind, %ns, name = %req.name, "Requiring web-app anti-affinity");
        patch_response(
            rsp,
            vec![
                set(path, present, serde_json::to_value(affinity)?),
                annotate(&meta, AFFINITY_ANNOTATION, annotation),
            ],
        )
    }
}

impl Admit {
    fn new(
        namespaces: Store<Namespace>,
        hpas: Store<HorizontalPodAutoscaler>,
        config: SharedConfig,
    ) -> Self {
        Self {
            namespaces,
            hpas,
            config,
            settings: ArcSwapOption::empty(),
        }
    }

    /// Returns the settings for the current configuration snapshot, parsing
    /// them only when the snapshot changes. Parsing happens outside of any
    /// lock; concurrent callers racing on a new snapshot may each parse it.
    fn settings(&self) -> Arc<Settings> {
        let config = self.config.get();
        if let Some(memo) = &*self.settings.load() {
            if Arc::ptr_eq(&memo.config, &config) {
                return memo.settings.clone();
            }
        }
        let settings = Arc::new(Settings::from_yaml(
            config.data.get(CONFIG_KEY).map(String::as_str),
        ));
        self.settings.store(Some(Arc::new(Memo {
            config,
            settings: settings.clone(),
        })));
        settings
    }

    /// Returns whether an affinity was already present along with the
    /// affinity carrying the required anti-affinity term.
    fn affinity_for(
        &self,
        settings: &Settings,
        ns: &str,
        labels: Option<&BTreeMap<String, String>>,
        spec: &PodSpec,
    ) -> Result<(bool, Affinity), Skip> {
        if !ns.starts_with(&settings.ns_prefix) {
            return Err(Skip::NamespacePrefix(
                ns.to_string(),
                settings.ns_prefix.clone(),
            ));
        }

        let value = labels
            .and_then(|l| l.get(&settings.pod_label))
            .ok_or_else(|| Skip::MissingLabel(settings.pod_label.clone()))?;

        let namespace = self
            .namespaces
            .get(&ObjectRef::new(ns))
            .ok_or_else(|| Skip::UnknownNamespace(ns.to_string()))?;
        if !settings
            .ns_selector
            .matches(&Labels::from(namespace.metadata.labels.clone()))
        {
            return Err(Skip::NamespaceMismatch(ns.to_string()));
        }

        let hpa = self
            .hpas
            .get(&ObjectRef::new(&settings.hpa_name).within(ns))
            .ok_or_else(|| Skip::UnknownHpa(ns.to_string(), settings.hpa_name.clone()))?;
        if !settings
            .hpa_selector
            .matches(&Labels::from(hpa.metadata.labels.clone()))
        {
            return Err(Skip::HpaMismatch(ns.to_string(), settings.hpa_name.clone()));
        }
        let max_replicas = hpa.spec.as_ref().map(|s| s.max_replicas).unwrap_or_default();
        if max_replicas > settings.maximum_hpa_replicas {
            return Err(Skip::TooManyReplicas(max_replicas));
        }

        let present = spec.affinity.is_some();
        let mut affinity = spec.affinity.clone().unwrap_or_default();
        let anti_affinity = affinity.pod_anti_affinity.get_or_insert_with(Default::default);
        let terms = anti_affinity
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new);
        let selects_label = |term: &PodAffinityTerm| {
            term.label_selector
                .as_ref()
                .and_then(|s| s.match_labels.as_ref())
                .is_some_and(|m| m.contains_key(&settings.pod_label))
        };
        if terms.iter().any(selects_label) {
            return Err(Skip::AlreadySet(settings.pod_label.clone()));
        }
        terms.push(PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    Some((settings.pod_label.clone(), value.clone()))
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            topology_key: settings.topology_key.clone(),
            ..Default::default()
        });

        Ok((present, affinity))
    }
}
