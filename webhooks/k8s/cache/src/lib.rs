//! Shared resource caches for admission plugins.
//!
//! An [`Informers`] instance owns one reflector per resource type. Plugins that
//! depend on the same resource type share a single watch and a single local
//! [`Store`] instead of opening redundant watches against the API server.
//!
//! Reflectors are registered lazily during server setup and are only started,
//! all at once, by [`Informers::start`], which resolves once every store has
//! completed its initial list. Admission handlers must never be served against
//! a store that has not been synced.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(test)]
mod tests;

use ahash::AHashMap as HashMap;
use futures::{future, prelude::*, stream::BoxStream};
use kube::runtime::{
    reflector::{self, store::Writer},
    WatchStreamExt,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::{
    any::{Any, TypeId},
    fmt,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use webhooks_manager_k8s_api::{self as k8s, watcher, Resource};

pub use kube::runtime::reflector::Store;

/// A stream of watch events feeding a reflector.
pub type EventStream<K> = BoxStream<'static, watcher::Result<watcher::Event<K>>>;

type Handler<K> = Box<dyn Fn(&watcher::Event<K>) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no watch source configured for {0}")]
    NoSource(String),

    #[error("{0} watch ended before its initial sync completed")]
    Unsynced(String),

    #[error("shutdown signaled before caches synced")]
    Shutdown,
}

/// A lazily started set of resource reflectors.
pub struct Informers {
    client: Option<k8s::Client>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    reflectors: HashMap<TypeId, Box<dyn Reflect>>,
    started: bool,
}

trait Reflect: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn spawn(&mut self, shutdown: drain::Watch) -> Result<(), Error>;

    fn ready(&self) -> future::BoxFuture<'static, Result<(), Error>>;
}

struct Reflector<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Option<Writer<K>>,
    source: Option<EventStream<K>>,
    handlers: Vec<Handler<K>>,
}

// === impl Informers ===

impl Default for Informers {
    /// Returns an instance without an API client. Every reflector must be fed
    /// by an explicit stream via [`Informers::reflect`].
    fn default() -> Self {
        Self {
            client: None,
            state: Mutex::new(State::default()),
        }
    }
}

impl fmt::Debug for Informers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Informers")
            .field("reflectors", &state.reflectors.len())
            .field("started", &state.started)
            .finish()
    }
}

impl Informers {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            client: Some(client),
            state: Mutex::new(State::default()),
        }
    }

    /// Returns the cache for `K`, watching all objects of that type in the
    /// cluster.
    pub fn store<K>(&self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        self.store_with(watcher::Config::default())
    }

    /// Returns the cache for `K`. The watch configuration only applies if this
    /// is the first registration for `K`.
    pub fn store_with<K>(&self, config: watcher::Config) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let source = self.api_source::<K>(config);
        let mut state = self.state.lock();
        let started = state.started;
        let reflector = state.reflector::<K>(source);
        if started && reflector.writer.is_some() {
            warn!(kind = %K::kind(&()), "Resource cache registered after informers started");
        }
        reflector.store.clone()
    }

    /// Returns the cache for `K`, fed by `events` if `K` has not yet been
    /// registered.
    pub fn reflect<K, S>(&self, events: S) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
        S: Stream<Item = watcher::Result<watcher::Event<K>>> + Send + 'static,
    {
        let mut state = self.state.lock();
        let reflector = state.reflector::<K>(move || Some(events.boxed()));
        reflector.store.clone()
    }

    /// Registers a callback invoked for every event on `K` after it has been
    /// applied to the cache. Callbacks run on the reflector's task, in
    /// registration order.
    pub fn on_event<K>(&self, handler: impl Fn(&watcher::Event<K>) + Send + Sync + 'static)
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if state.started {
            warn!(kind = %K::kind(&()), "Ignoring event handler registered after start");
            return;
        }
        let source = self.api_source::<K>(watcher::Config::default());
        let reflector = state.reflector::<K>(source);
        reflector.handlers.push(Box::new(handler));
    }

    fn api_source<K>(
        &self,
        config: watcher::Config,
    ) -> impl FnOnce() -> Option<EventStream<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let client = self.client.clone();
        move || {
            client.map(|client| {
                watcher::watcher(k8s::Api::<K>::all(client), config)
                    .default_backoff()
                    .boxed()
            })
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Starts every registered reflector and waits for all caches to complete
    /// their initial sync.
    ///
    /// Repeated calls do not spawn new watches but still wait for the caches
    /// to become ready.
    pub async fn start(&self, shutdown: drain::Watch) -> Result<(), Error> {
        let ready = {
            let mut state = self.state.lock();
            if !state.started {
                for reflector in state.reflectors.values_mut() {
                    reflector.spawn(shutdown.clone())?;
                }
                state.started = true;
            }
            state
                .reflectors
                .values()
                .map(|r| r.ready())
                .collect::<Vec<_>>()
        };

        debug!(caches = ready.len(), "Waiting for caches to sync");
        tokio::select! {
            res = future::try_join_all(ready) => {
                res?;
                info!("Caches synced");
                Ok(())
            }
            _release = shutdown.signaled() => Err(Error::Shutdown),
        }
    }
}

impl State {
    fn reflector<K>(&mut self, source: impl FnOnce() -> Option<EventStream<K>>) -> &mut Reflector<K>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        self.reflectors
            .entry(TypeId::of::<K>())
            .or_insert_with(|| Box::new(Reflector::new(source())))
            .as_any_mut()
            .downcast_mut::<Reflector<K>>()
            .expect("reflectors must be keyed by their resource type")
    }
}

// === impl Reflector ===

impl<K> Reflector<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn new(source: Option<EventStream<K>>) -> Self {
        let writer = Writer::default();
        Self {
            store: writer.as_reader(),
            writer: Some(writer),
            source,
            handlers: Vec::new(),
        }
    }
}

impl<K> Reflect for Reflector<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn spawn(&mut self, shutdown: drain::Watch) -> Result<(), Error> {
        let kind = K::kind(&()).to_string();
        let (Some(writer), Some(source)) = (self.writer.take(), self.source.take()) else {
            return Err(Error::NoSource(kind));
        };
        let handlers = std::mem::take(&mut self.handlers);
        tokio::spawn(
            reflect(writer, source, handlers, shutdown)
                .instrument(info_span!("informer", kind = %kind.to_lowercase())),
        );
        Ok(())
    }

    fn ready(&self) -> future::BoxFuture<'static, Result<(), Error>> {
        let store = self.store.clone();
        Box::pin(async move {
            store
                .wait_until_ready()
                .await
                .map_err(|_| Error::Unsynced(K::kind(&()).to_string()))
        })
    }
}

async fn reflect<K>(
    writer: Writer<K>,
    source: EventStream<K>,
    handlers: Vec<Handler<K>>,
    shutdown: drain::Watch,
) where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let events = reflector::reflector(writer, source);
    tokio::pin!(events);
    let signaled = shutdown.signaled();
    tokio::pin!(signaled);

    loop {
        tokio::select! {
            biased;

            _release = &mut signaled => {
                debug!("Shutting down");
                return;
            }

            ev = events.next() => match ev {
                Some(Ok(ev)) => {
                    for handler in &handlers {
                        handler(&ev);
                    }
                }
                Some(Err(error)) => warn!(%error, "Watch failed"),
                None => {
                    info!("Watch stream ended");
                    return;
                }
            },
        }
    }
}
