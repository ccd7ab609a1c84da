use crate::{cert::CertWatcher, server::Server};
use anyhow::{Context, Result};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, time};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};

const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// A bound HTTPS listener whose certificate is served from a [`CertWatcher`].
pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    addr: SocketAddr,
}

// === impl Listener ===

impl Listener {
    pub async fn bind(addr: SocketAddr, certs: CertWatcher) -> Result<Self> {
        let config = server_config(certs)?;
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let addr = tcp.local_addr()?;
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts connections until `shutdown` is signaled. In-flight connections
    /// are then asked to close and given up to `grace` to finish.
    pub async fn serve(self, server: Server, shutdown: drain::Watch, grace: time::Duration) {
        let Self {
            tcp,
            acceptor,
            addr,
        } = self;
        info!(%addr, "Admission server listening");

        let signaled = shutdown.clone().signaled();
        tokio::pin!(signaled);
        loop {
            tokio::select! {
                _release = &mut signaled => {
                    info!("Admission server stopped accepting connections");
                    return;
                }

                res = tcp.accept() => match res {
                    Ok((io, peer)) => {
                        let conn = serve_conn(
                            io,
                            acceptor.clone(),
                            server.clone(),
                            shutdown.clone(),
                            grace,
                        );
                        tokio::spawn(conn.instrument(info_span!("conn", %peer)));
                    }
                    Err(error) => warn!(%error, "Failed to accept connection"),
                },
            }
        }
    }
}

async fn serve_conn(
    io: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    server: Server,
    shutdown: drain::Watch,
    grace: time::Duration,
) {
    let tls = match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(io)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => {
            debug!(%error, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!("TLS handshake timed out");
            return;
        }
    };

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls), TowerToHyperService::new(server));
    tokio::pin!(conn);

    tokio::select! {
        res = &mut conn => {
            if let Err(error) = res {
                warn!(%error, "Connection failed");
            }
        }

        release = shutdown.signaled() => {
            conn.as_mut().graceful_shutdown();
            match time::timeout(grace, &mut conn).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "Connection failed"),
                Err(_) => warn!(?grace, "Connection did not complete within the grace period"),
            }
            drop(release);
        }
    }
}

fn server_config(certs: CertWatcher) -> Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(certs));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/cert-a.pem");
    const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/key-a.pem");

    #[test]
    fn negotiates_h2_and_http1() {
        let certs = CertWatcher::new(CERT, KEY).expect("fixture pair must load");
        let config = server_config(certs).expect("config must build");
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[tokio::test]
    async fn stops_accepting_on_shutdown() {
        let certs = CertWatcher::new(CERT, KEY).expect("fixture pair must load");
        let listener = Listener::bind(([127, 0, 0, 1], 0).into(), certs)
            .await
            .expect("listener must bind");
        assert_ne!(listener.local_addr().port(), 0);

        let server = crate::server::Builder::new(Default::default(), None).seal();
        let (signal, shutdown) = drain::channel();
        let task = tokio::spawn(listener.serve(server, shutdown, time::Duration::from_secs(1)));

        time::timeout(time::Duration::from_secs(5), signal.drain())
            .await
            .expect("listener must release the shutdown handle");
        time::timeout(time::Duration::from_secs(5), task)
            .await
            .expect("listener must stop")
            .expect("listener must not panic");
    }
}
