//! The DNS listener: owns the bound UDP socket (and optionally
//! a TCP listener) and spawns an independent handler task per datagram,
//! bounded by a semaphore so a burst of traffic can't spawn unbounded tasks.

use crate::constants::{MAX_CONCURRENT_QUERIES, MAX_UDP_PACKET_SIZE, TCP_LENGTH_PREFIX_BYTES};
use crate::drivers::logs::{ClientInfo, Transport};
use crate::error::{ProxyError, Result};
use crate::resolver::ResolverPipeline;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, warn};

pub struct Listener {
    pipeline: Arc<ResolverPipeline>,
    concurrency: Arc<Semaphore>,
}

impl Listener {
    pub fn new(pipeline: Arc<ResolverPipeline>) -> Self {
        Listener {
            pipeline,
            concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES)),
        }
    }

    /// Bind the UDP socket. Surfaces `PortPrivilegeDenied` rather than
    /// `BindFailed` when the OS rejects a sub-1024 bind for lack of
    /// capability, so the supervisor can refuse to start outright rather
    /// than silently pick a different port, and can tell the two failure
    /// modes apart without having to pre-guess the process's privilege
    /// level itself.
    pub async fn bind_udp(port: u16) -> Result<UdpSocket> {
        UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            if port < 1024 && e.kind() == std::io::ErrorKind::PermissionDenied {
                ProxyError::PortPrivilegeDenied(port)
            } else {
                ProxyError::BindFailed(e.to_string())
            }
        })
    }

    pub async fn serve_udp(&self, socket: UdpSocket, mut shutdown: broadcast::Receiver<()>) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("udp listener received shutdown signal");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, client_addr) = match received {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(%err, "udp recv_from failed");
                            continue;
                        }
                    };
                    let datagram = buf[..len].to_vec();
                    self.spawn_udp_handler(socket.clone(), datagram, client_addr);
                }
            }
        }
    }

    fn spawn_udp_handler(&self, socket: Arc<UdpSocket>, datagram: Vec<u8>, client_addr: SocketAddr) {
        let permit = self.concurrency.clone();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permit.acquire_owned().await else {
                return;
            };
            let client = ClientInfo {
                addr: client_addr.ip().to_string(),
                port: client_addr.port(),
                transport: Transport::Udp,
            };
            let response = pipeline.handle(&datagram, client).await;
            if let Err(err) = socket.send_to(&response, client_addr).await {
                error!(%err, %client_addr, "failed to send udp response");
            }
        });
    }

    /// Optional TCP listener. Reads the 2-byte length prefix per RFC 1035
    /// 4.2.2 and writes a length-prefixed response on the same connection.
    pub async fn run_tcp(
        &self,
        port: u16,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ProxyError::BindFailed(e.to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("tcp listener received shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, client_addr) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(%err, "tcp accept failed");
                            continue;
                        }
                    };
                    self.spawn_tcp_handler(stream, client_addr);
                }
            }
        }
    }

    fn spawn_tcp_handler(&self, mut stream: tokio::net::TcpStream, client_addr: SocketAddr) {
        let permit = self.concurrency.clone();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permit.acquire_owned().await else {
                return;
            };

            let mut len_prefix = [0u8; TCP_LENGTH_PREFIX_BYTES];
            if stream.read_exact(&mut len_prefix).await.is_err() {
                return;
            }
            let len = u16::from_be_bytes(len_prefix) as usize;
            let mut query = vec![0u8; len];
            if stream.read_exact(&mut query).await.is_err() {
                return;
            }

            let client = ClientInfo {
                addr: client_addr.ip().to_string(),
                port: client_addr.port(),
                transport: Transport::Tcp,
            };
            let response = pipeline.handle(&query, client).await;

            let prefix = (response.len() as u16).to_be_bytes();
            if stream.write_all(&prefix).await.is_err() {
                return;
            }
            let _ = stream.write_all(&response).await;
        });
    }
}
