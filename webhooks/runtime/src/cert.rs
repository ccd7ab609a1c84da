//! Serves the webhook's TLS certificate and reloads it when it is rotated on
//! disk.

use arc_swap::ArcSwap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate: {0}")]
    Tls(#[from] rustls::Error),
}

/// Holds the most recently loaded certificate chain and key.
///
/// The chain and key are swapped in together, so a handshake never sees a
/// certificate paired with a key from another load.
#[derive(Clone)]
pub struct CertWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: ArcSwap<CertifiedKey>,
}

// === impl CertWatcher ===

impl CertWatcher {
    /// Loads the initial pair, failing if either file is missing or invalid.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let current = load(&cert_path, &key_path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                cert_path,
                key_path,
                current: ArcSwap::from_pointee(current),
            }),
        })
    }

    /// Returns the current certificate. Never blocks.
    pub fn certificate(&self) -> Arc<CertifiedKey> {
        self.inner.current.load_full()
    }

    /// Loads both files and swaps them in. On error the current pair is kept.
    pub fn reload(&self) -> Result<(), Error> {
        let next = load(&self.inner.cert_path, &self.inner.key_path)?;
        self.inner.current.store(Arc::new(next));
        Ok(())
    }

    /// Reloads the pair whenever either file is written, created or replaced,
    /// until `shutdown` is signaled.
    pub async fn run(self, shutdown: drain::Watch) -> Result<(), notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        let paths = [self.inner.cert_path.clone(), self.inner.key_path.clone()];
        let mut watched = Vec::with_capacity(paths.len());
        for path in &paths {
            watched.push(watch(&mut watcher, path)?);
        }
        info!(cert = %paths[0].display(), key = %paths[1].display(), "Watching certificate");

        let signaled = shutdown.signaled();
        tokio::pin!(signaled);
        loop {
            tokio::select! {
                biased;

                _release = &mut signaled => break,

                ev = rx.recv() => match ev {
                    Some(Ok(ev)) => self.on_event(&mut watcher, &mut watched, ev),
                    Some(Err(error)) => warn!(%error, "Certificate watch failed"),
                    None => break,
                },
            }
        }

        for path in &watched {
            if let Err(error) = watcher.unwatch(path) {
                trace!(%error, path = %path.display(), "Failed to unwatch");
            }
        }
        debug!("Certificate watch stopped");
        Ok(())
    }

    fn on_event(
        &self,
        watcher: &mut RecommendedWatcher,
        watched: &mut Vec<PathBuf>,
        ev: notify::Event,
    ) {
        trace!(?ev);
        match ev.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {}
            EventKind::Remove(_) => {
                // A replaced file loses its watch; re-establish it so later
                // rotations are still observed.
                for path in [&self.inner.cert_path, &self.inner.key_path] {
                    if ev.paths.iter().any(|p| p == path) {
                        match watch(watcher, path) {
                            Ok(w) if !watched.contains(&w) => watched.push(w),
                            Ok(_) => {}
                            Err(error) => {
                                warn!(%error, path = %path.display(), "Failed to re-watch")
                            }
                        }
                    }
                }
            }
            _ => return,
        }

        match self.reload() {
            Ok(()) => info!("Reloaded certificate"),
            Err(error) => warn!(%error, "Failed to reload certificate; serving the previous one"),
        }
    }
}

impl ResolvesServerCert for CertWatcher {
    fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certificate())
    }
}

impl fmt::Debug for CertWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertWatcher")
            .field("cert_path", &self.inner.cert_path)
            .field("key_path", &self.inner.key_path)
            .finish_non_exhaustive()
    }
}

/// Watches `path`, or its parent directory when the file itself cannot be
/// watched, and returns whichever path is watched.
fn watch(watcher: &mut RecommendedWatcher, path: &Path) -> Result<PathBuf, notify::Error> {
    match watcher.watch(path, RecursiveMode::NonRecursive) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(error) => {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or(error)?;
            debug!(path = %path.display(), "Watching parent directory");
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
            Ok(parent.to_path_buf())
        }
    }
}

fn load(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, Error> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| Error::Io { path, source }
    };

    let cert_pem = std::fs::read(cert_path).map_err(io_err(cert_path))?;
    let key_pem = std::fs::read(key_path).map_err(io_err(key_path))?;

    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(cert_path))?;
    if chain.is_empty() {
        return Err(Error::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(io_err(key_path))?
        .ok_or_else(|| Error::NoPrivateKey(key_path.to_path_buf()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;

    let certified = CertifiedKey::new(chain, signing_key);
    certified.keys_match()?;
    Ok(certified)
}
