use crate::{
    cache::Informers,
    cert::CertWatcher,
    config,
    core::{config::Source, Config, DefaultPolicy, Plugin, Setup, KUBERNETES_FACTORY},
    events::KubeEvents,
    metrics::AdmissionMetrics,
    plugins, server, tls,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "webhooks-manager", about = "A pluggable Kubernetes admission webhook server")]
pub struct Args {
    #[clap(long, default_value = "webhooks=info,warn", env = "WEBHOOKS_MANAGER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The port on which admission requests are served over TLS.
    #[clap(long, default_value = "443")]
    port: u16,

    #[clap(long, default_value = "/etc/webhook/certs/cert.pem")]
    tls_cert_file: PathBuf,

    #[clap(long, default_value = "/etc/webhook/certs/key.pem")]
    tls_key_file: PathBuf,

    /// Reads dynamic configuration from a ConfigMap, creating it if needed.
    #[clap(long)]
    use_config_map: bool,

    #[clap(long, default_value = "kube-system")]
    config_map_namespace: String,

    #[clap(long, default_value = "webhooks-manager-config")]
    config_map_name: String,

    /// The decision for requests whose path matches no handler.
    #[clap(long, default_value = "Always")]
    default_admit_policy: DefaultPolicy,

    /// Adds zone anti-affinity to replicated deployments and their pods.
    #[clap(long)]
    deployment_affinity: bool,

    /// Upgrades ingress-nginx rewrite-target annotations to capture groups.
    #[clap(long)]
    ingress_rewrite_target: bool,

    /// Adds host anti-affinity to jive web-app pods.
    #[clap(long)]
    jive_webapps_affinity: bool,

    /// How long in-flight requests may run once shutdown begins.
    #[clap(long, default_value = "5")]
    shutdown_grace_period_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let plugins = self.plugins();
        let Self {
            log_level,
            log_format,
            client,
            admin,
            port,
            tls_cert_file,
            tls_key_file,
            use_config_map,
            config_map_namespace,
            config_map_name,
            default_admit_policy,
            shutdown_grace_period_secs,
            ..
        } = self;

        // Both rustls and kube's client share the process-wide provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut prom = <Registry>::default();
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let certs = CertWatcher::new(&tls_cert_file, &tls_key_file)
            .context("failed to load TLS certificate")?;

        let client = runtime.client();
        let shutdown = runtime.shutdown_handle();

        let source = use_config_map.then(|| Source {
            namespace: config_map_namespace,
            name: config_map_name,
        });
        let initial = match &source {
            Some(source) => config::load(client.clone(), source, default_admit_policy).await?,
            None => Config::new(default_admit_policy),
        };
        info!(policy = %initial.default_policy, dynamic = source.is_some(), "Loaded configuration");
        let (writer, shared) = crate::core::config::channel(initial);

        let events = KubeEvents::spawn(client.clone(), std::env::var("HOSTNAME").ok());
        let mut builder = server::Builder::new(shared, Some(client.clone()))
            .with_events(Arc::new(events))
            .with_metrics(metrics);

        // The configuration cache is registered first so that plugins share it.
        if let Some(source) = source {
            let informers = Arc::new(Informers::new(client));
            config::watch(&informers, source, writer);
            builder.register_factory(KUBERNETES_FACTORY, informers);
        }

        for (path, plugin) in plugins {
            info!(plugin = plugin.name(), %path, "Enabling plugin");
            plugin
                .setup(&mut builder, path)
                .with_context(|| format!("failed to set up {} at {path}", plugin.name()))?;
        }
        let server = builder.seal();

        server.start_factories(shutdown.clone()).await?;

        tokio::spawn(
            certs
                .clone()
                .run(shutdown.clone())
                .map(|res| {
                    if let Err(error) = res {
                        error!(%error, "Certificate watch failed");
                    }
                })
                .instrument(info_span!("certs")),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tls::Listener::bind(addr, certs).await?;
        tokio::spawn(
            listener
                .serve(
                    server,
                    shutdown,
                    Duration::from_secs(shutdown_grace_period_secs),
                )
                .instrument(info_span!("admission")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    /// The enabled plugins and the paths they serve.
    fn plugins(&self) -> Vec<(&'static str, Box<dyn Plugin>)> {
        let mut enabled = Vec::<(&'static str, Box<dyn Plugin>)>::new();
        if self.deployment_affinity {
            enabled.push((
                "/deployment/affinity",
                Box::new(plugins::DeploymentAffinity::default()),
            ));
        }
        if self.ingress_rewrite_target {
            enabled.push(("/ingress/rewrite", Box::new(plugins::RewriteTarget::default())));
        }
        if self.jive_webapps_affinity {
            enabled.push(("/jive/webapp", Box::new(plugins::WebAppAffinity::default())));
        }
        enabled
    }
}
