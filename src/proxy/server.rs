use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::settings::ServerConfig;

use super::http_handler::HttpHandler;

/// Public HTTP listener in front of the protected application.
pub struct ProxyServer {
    config: ServerConfig,
    handler: Arc<HttpHandler>,
    active: Arc<AtomicUsize>,
}

impl ProxyServer {
    pub fn new(config: &ServerConfig, handler: Arc<HttpHandler>) -> Self {
        Self {
            config: config.clone(),
            handler,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> Result<()> {
        let bind = &self.config.bind;
        let listener = bind_tcp_listener(bind)?;
        let listener = TcpListener::from_std(listener)
            .with_context(|| format!("Failed to register listener on {}", bind))?;
        info!(addr = %bind, upstream = %self.config.upstream, "HTTP listener started");

        let max_connections = self.config.max_connections;

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept TCP connection: {}", err);
                    continue;
                }
            };

            let peer_ip = peer_addr.ip().to_canonical();

            if self.active_connections() >= max_connections {
                debug!(client_ip = %peer_ip, "Max connections reached, dropping");
                drop(stream);
                continue;
            }

            let guard = ConnectionGuard::new(Arc::clone(&self.active));
            let handler = Arc::clone(&self.handler);

            tokio::spawn(async move {
                serve_connection(stream, handler, peer_ip).await;
                drop(guard);
            });
        }
    }
}

fn bind_tcp_listener(addr: &str) -> Result<std::net::TcpListener> {
    let sock_addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", addr))?;

    let domain = if sock_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket
        .bind(&sock_addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(8192)?;

    Ok(socket.into())
}

async fn serve_connection(stream: TcpStream, handler: Arc<HttpHandler>, peer_ip: IpAddr) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let h = Arc::clone(&handler);
        async move {
            let resp = h.handle(req, peer_ip).await;
            Ok::<_, hyper::Error>(resp)
        }
    });

    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service);

    if let Err(err) = conn.await {
        debug!(client_ip = %peer_ip, error = %err, "HTTP connection error");
    }
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self { active }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
