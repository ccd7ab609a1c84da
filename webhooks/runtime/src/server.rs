use crate::{
    cache::Informers,
    core::{
        AdmitAlways, AdmitNever, DefaultPolicy, DuplicatePath, Handler, Setup, SharedConfig,
    },
    events::{EventSink, NoopEvents},
    k8s,
    metrics::AdmissionMetrics,
};
use anyhow::{Context, Result};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, info};

/// Collects handlers and caches while plugins are set up.
pub struct Builder {
    handlers: HashMap<String, Arc<dyn Handler>>,
    factories: BTreeMap<String, Arc<Informers>>,
    config: SharedConfig,
    client: Option<k8s::Client>,
    events: Arc<dyn EventSink>,
    metrics: AdmissionMetrics,
}

/// The sealed server. Its registries cannot change once built.
#[derive(Clone)]
pub struct Server {
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    /// Registered paths, longest first.
    prefixes: Arc<[String]>,
    factories: Arc<BTreeMap<String, Arc<Informers>>>,
    config: SharedConfig,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) metrics: AdmissionMetrics,
}

/// The handler chosen for a request path.
pub(crate) struct Route {
    /// The registered path that matched, or the request path when the default
    /// policy applies.
    pub path: String,
    pub handler: Arc<dyn Handler>,
}

// === impl Builder ===

impl Builder {
    pub fn new(config: SharedConfig, client: Option<k8s::Client>) -> Self {
        Self {
            handlers: HashMap::new(),
            factories: BTreeMap::new(),
            config,
            client,
            events: Arc::new(NoopEvents::default()),
            metrics: AdmissionMetrics::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: AdmissionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn seal(self) -> Server {
        let mut prefixes = self.handlers.keys().cloned().collect::<Vec<_>>();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        info!(paths = ?prefixes, factories = ?self.factories.keys().collect::<Vec<_>>(), "Server sealed");
        Server {
            handlers: Arc::new(self.handlers),
            prefixes: prefixes.into(),
            factories: Arc::new(self.factories),
            config: self.config,
            events: self.events,
            metrics: self.metrics,
        }
    }
}

impl Setup for Builder {
    fn register_handler(
        &mut self,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), DuplicatePath> {
        match self.handlers.entry(path.to_string()) {
            Entry::Occupied(_) => Err(DuplicatePath(path.to_string())),
            Entry::Vacant(entry) => {
                debug!(%path, "Registered handler");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    fn register_factory(&mut self, name: &str, informers: Arc<Informers>) {
        if self.factories.contains_key(name) {
            debug!(%name, "Factory already registered");
            return;
        }
        self.factories.insert(name.to_string(), informers);
    }

    fn get_factory(&self, name: &str) -> Option<Arc<Informers>> {
        self.factories.get(name).cloned()
    }

    fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    fn client(&self) -> Option<k8s::Client> {
        self.client.clone()
    }
}

// === impl Server ===

impl Server {
    /// Starts every registered cache and waits for each to complete its
    /// initial sync. Requests must not be served until this succeeds.
    pub async fn start_factories(&self, shutdown: drain::Watch) -> Result<()> {
        for (name, informers) in self.factories.iter() {
            self.start_factory(name, informers, shutdown.clone()).await?;
        }
        Ok(())
    }

    async fn start_factory(
        &self,
        name: &str,
        informers: &Informers,
        shutdown: drain::Watch,
    ) -> Result<()> {
        debug!(%name, "Starting cache");
        informers
            .start(shutdown)
            .await
            .with_context(|| format!("failed to start {name} cache"))?;
        info!(%name, "Cache synced");
        Ok(())
    }

    pub fn get_factory(&self, name: &str) -> Option<Arc<Informers>> {
        self.factories.get(name).cloned()
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Resolves the handler for `path`: an exact registration, else the
    /// longest registered path that is a prefix of it, else the configured
    /// default policy.
    pub(crate) fn route(&self, path: &str) -> Route {
        if let Some(handler) = self.handlers.get(path) {
            return Route {
                path: path.to_string(),
                handler: handler.clone(),
            };
        }

        if let Some(prefix) = self.prefixes.iter().find(|p| path.starts_with(p.as_str())) {
            if let Some(handler) = self.handlers.get(prefix) {
                return Route {
                    path: prefix.clone(),
                    handler: handler.clone(),
                };
            }
        }

        let handler: Arc<dyn Handler> = match self.config.get().default_policy {
            DefaultPolicy::Always => Arc::new(AdmitAlways),
            DefaultPolicy::Never => Arc::new(AdmitNever),
        };
        Route {
            path: path.to_string(),
            handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        config, AdmissionRequest, AdmissionResponse, Config, KUBERNETES_FACTORY,
    };
    use futures::prelude::*;
    use k8s::{watcher, ConfigMap};
    use maplit::btreemap;

    fn tagged(tag: &'static str) -> Arc<dyn Handler> {
        Arc::new(move |req: &AdmissionRequest| -> anyhow::Result<AdmissionResponse> {
            Ok(AdmissionResponse::from(req).deny(tag))
        })
    }

    fn admit(server: &Server, path: &str) -> (String, Option<String>, bool) {
        let Route { path, handler } = server.route(path);
        let req: AdmissionRequest = serde_json::from_value(serde_json::json!({
            "uid": "0",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": "CREATE",
            "userInfo": {},
        }))
        .unwrap();
        let rsp = handler.admit(&req).unwrap();
        let message = Some(rsp.result.message).filter(|m| !m.is_empty());
        (path, message, rsp.allowed)
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let mut builder = Builder::new(SharedConfig::default(), None);
        builder.register_handler("/a", tagged("a")).unwrap();
        assert_eq!(
            builder.register_handler("/a", tagged("b")),
            Err(DuplicatePath("/a".to_string()))
        );
        let server = builder.seal();
        assert_eq!(admit(&server, "/a").1.as_deref(), Some("a"));
    }

    #[test]
    fn longest_registered_prefix_wins() {
        let mut builder = Builder::new(SharedConfig::default(), None);
        builder.register_handler("/deployment", tagged("short")).unwrap();
        builder
            .register_handler("/deployment/affinity", tagged("long"))
            .unwrap();
        let server = builder.seal();

        assert_eq!(
            admit(&server, "/deployment/affinity"),
            ("/deployment/affinity".to_string(), Some("long".to_string()), false)
        );
        assert_eq!(
            admit(&server, "/deployment/affinity/v2"),
            ("/deployment/affinity".to_string(), Some("long".to_string()), false)
        );
        assert_eq!(
            admit(&server, "/deployment/other"),
            ("/deployment".to_string(), Some("short".to_string()), false)
        );
        // Prefixes are compared as raw strings, not path segments.
        assert_eq!(
            admit(&server, "/deployments").0,
            "/deployment".to_string()
        );
    }

    #[test]
    fn unmatched_paths_follow_the_live_default_policy() {
        let (writer, config) = config::channel(Config::default());
        let mut builder = Builder::new(config, None);
        builder.register_handler("/a", tagged("a")).unwrap();
        let server = builder.seal();

        assert_eq!(admit(&server, "/b"), ("/b".to_string(), None, true));

        writer.reconcile(btreemap! {
            "DefaultAdmitPolicy".to_string() => "never".to_string(),
        });
        assert_eq!(admit(&server, "/b"), ("/b".to_string(), None, false));

        writer.reconcile(btreemap! {
            "DefaultAdmitPolicy".to_string() => "Always".to_string(),
        });
        assert_eq!(admit(&server, "/b"), ("/b".to_string(), None, true));
    }

    #[test]
    fn first_factory_registration_wins() {
        let mut builder = Builder::new(SharedConfig::default(), None);
        let first = Arc::new(Informers::default());
        builder.register_factory(KUBERNETES_FACTORY, first.clone());
        builder.register_factory(KUBERNETES_FACTORY, Arc::new(Informers::default()));
        let found = builder.get_factory(KUBERNETES_FACTORY).unwrap();
        assert!(Arc::ptr_eq(&found, &first));

        let setup: &mut dyn Setup = &mut builder;
        assert!(Arc::ptr_eq(&setup.factory_or_register(KUBERNETES_FACTORY), &first));
        let other = setup.factory_or_register("other");
        assert!(Arc::ptr_eq(&setup.factory_or_register("other"), &other));

        let server = builder.seal();
        assert!(Arc::ptr_eq(
            &server.get_factory(KUBERNETES_FACTORY).unwrap(),
            &first
        ));
        assert!(server.get_factory("missing").is_none());
    }

    #[tokio::test]
    async fn start_factories_waits_for_every_cache() {
        let mut builder = Builder::new(SharedConfig::default(), None);
        let synced = Arc::new(Informers::default());
        let _ = synced.reflect::<ConfigMap, _>(
            stream::iter(vec![
                Ok(watcher::Event::Init),
                Ok(watcher::Event::InitDone),
            ])
            .chain(stream::pending()),
        );
        builder.register_factory("synced", synced.clone());
        let server = builder.seal();

        let (_signal, shutdown) = drain::channel();
        server
            .start_factories(shutdown)
            .await
            .expect("caches must sync");
        assert!(synced.is_started());
    }

    #[tokio::test]
    async fn start_factories_fails_when_a_cache_cannot_sync() {
        let mut builder = Builder::new(SharedConfig::default(), None);
        let broken = Arc::new(Informers::default());
        let _ = broken.reflect::<ConfigMap, _>(stream::iter(vec![Ok(watcher::Event::Init)]));
        builder.register_factory("broken", broken);
        let server = builder.seal();

        let (_signal, shutdown) = drain::channel();
        let error = server.start_factories(shutdown).await.unwrap_err();
        assert!(error.to_string().contains("broken"), "{error:#}");
    }
}
