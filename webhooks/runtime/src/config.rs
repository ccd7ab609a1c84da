//! Keeps the runtime configuration in sync with its ConfigMap.

use crate::{
    cache::Informers,
    core::{
        config::{Source, DEFAULT_ADMIT_POLICY_KEY},
        Config, ConfigWriter, DefaultPolicy, COMPONENT_NAME,
    },
    k8s::{
        self, watcher, Api, Client, ConfigMap, ObjectMeta, Patch, PatchParams, PostParams,
        ResourceExt,
    },
};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Reads the initial configuration from the ConfigMap named by `source`.
///
/// A missing ConfigMap is created holding `policy`, and one without a default
/// admit policy has `policy` merged into it, so operators always find the
/// effective value in the cluster.
pub async fn load(client: Client, source: &Source, policy: DefaultPolicy) -> Result<Config> {
    let api = Api::<ConfigMap>::namespaced(client, &source.namespace);
    let base = Config::new(policy).with_source(&source.namespace, &source.name);

    let mut data = match get_data(&api, source).await? {
        Some(data) => data,
        None => {
            let data = default_data(policy);
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    namespace: Some(source.namespace.clone()),
                    name: Some(source.name.clone()),
                    ..Default::default()
                },
                data: Some(data.clone()),
                ..Default::default()
            };
            let params = PostParams {
                field_manager: Some(COMPONENT_NAME.to_string()),
                ..Default::default()
            };
            match api.create(&params, &cm).await {
                Ok(_) => {
                    info!(ns = %source.namespace, name = %source.name, %policy, "Created ConfigMap");
                    return Ok(base.reconcile(data));
                }
                // Another replica created it first.
                Err(k8s::Error::Api(error)) if error.code == 409 => {
                    debug!(ns = %source.namespace, name = %source.name, "ConfigMap already exists");
                    get_data(&api, source).await?.ok_or_else(|| {
                        anyhow!(
                            "ConfigMap {}/{} was deleted while it was being created",
                            source.namespace,
                            source.name
                        )
                    })?
                }
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!("failed to create ConfigMap {}/{}", source.namespace, source.name)
                    })
                }
            }
        }
    };

    if !data.contains_key(DEFAULT_ADMIT_POLICY_KEY) {
        let patch = serde_json::json!({ "data": default_data(policy) });
        let params = PatchParams {
            field_manager: Some(COMPONENT_NAME.to_string()),
            ..Default::default()
        };
        api.patch(&source.name, &params, &Patch::Merge(&patch))
            .await
            .with_context(|| {
                format!("failed to patch ConfigMap {}/{}", source.namespace, source.name)
            })?;
        info!(ns = %source.namespace, name = %source.name, %policy, "Added default admit policy to ConfigMap");
        data.extend(default_data(policy));
    }

    Ok(base.reconcile(data))
}

/// Watches the source ConfigMap through `informers`, reconciling every update
/// into `writer`. Deleting the ConfigMap keeps the last configuration.
pub fn watch(informers: &Informers, source: Source, writer: ConfigWriter) {
    let fields = format!(
        "metadata.name={},metadata.namespace={}",
        source.name, source.namespace
    );
    let _ = informers.store_with::<ConfigMap>(watcher::Config::default().fields(&fields));
    informers.on_event::<ConfigMap>(move |ev| match ev {
        watcher::Event::Apply(cm) | watcher::Event::InitApply(cm) => {
            if cm.namespace().as_deref() != Some(source.namespace.as_str())
                || cm.name_any() != source.name
            {
                return;
            }
            let data = cm.data.clone().unwrap_or_default();
            let config = writer.reconcile(data);
            info!(policy = %config.default_policy, keys = config.data.len(), "Configuration updated");
        }
        watcher::Event::Delete(cm) if cm.name_any() == source.name => {
            debug!(name = %source.name, "ConfigMap deleted; keeping the last configuration");
        }
        _ => {}
    });
}

async fn get_data(
    api: &Api<ConfigMap>,
    source: &Source,
) -> Result<Option<BTreeMap<String, String>>> {
    let cm = api
        .get_opt(&source.name)
        .await
        .with_context(|| format!("failed to get ConfigMap {}/{}", source.namespace, source.name))?;
    Ok(cm.map(|cm| cm.data.unwrap_or_default()))
}

fn default_data(policy: DefaultPolicy) -> BTreeMap<String, String> {
    std::iter::once((DEFAULT_ADMIT_POLICY_KEY.to_string(), policy.to_string())).collect()
}
