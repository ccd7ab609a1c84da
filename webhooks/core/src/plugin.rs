use crate::{config::SharedConfig, handler::Handler};
use std::sync::Arc;
use thiserror::Error;
use webhooks_manager_k8s_api as k8s;
use webhooks_manager_k8s_cache::Informers;

/// A second handler was registered for a path.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("a handler is already registered for path {0:?}")]
pub struct DuplicatePath(pub String);

/// The server's registration surface, available only while the server is
/// being set up.
pub trait Setup {
    fn register_handler(
        &mut self,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), DuplicatePath>;

    /// Registers a shared cache under `name`. If `name` is already taken the
    /// existing cache is kept and `informers` is dropped.
    fn register_factory(&mut self, name: &str, informers: Arc<Informers>);

    fn get_factory(&self, name: &str) -> Option<Arc<Informers>>;

    fn config(&self) -> SharedConfig;

    /// An API client, when the server runs against a cluster.
    fn client(&self) -> Option<k8s::Client>;
}

/// A decision plugin.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Registers the plugin's handler at `path` along with any caches it
    /// reads from.
    fn setup(&self, server: &mut dyn Setup, path: &str) -> anyhow::Result<()>;
}

impl dyn Setup + '_ {
    /// Returns the cache registered as `name`, registering a new one if the
    /// name is free.
    pub fn factory_or_register(&mut self, name: &str) -> Arc<Informers> {
        if let Some(informers) = self.get_factory(name) {
            return informers;
        }
        let informers = Arc::new(match self.client() {
            Some(client) => Informers::new(client),
            None => Informers::default(),
        });
        self.register_factory(name, informers.clone());
        self.get_factory(name).unwrap_or(informers)
    }
}
