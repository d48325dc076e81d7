//! Pure-code TCP relay for panel-originated paths.
//!
//! An accept loop per forwarded port; each connection dials the target with
//! a bounded timeout and keep-alives, then two copy loops shuttle bytes
//! with an idle probe instead of a hard teardown, so long-lived quiet
//! connections survive.

use std::collections::HashMap;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const COPY_BUF: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(
        "port {0} is already in use; make sure the panel runs with host networking, \
         the port is exposed, and no other service claims it"
    )]
    AddrInUse(u16),
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

struct Forward {
    task: JoinHandle<()>,
    target: String,
}

#[derive(Default)]
pub struct PortForwarder {
    forwards: HashMap<u16, Forward>,
}

impl PortForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_forward(
        &mut self,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<(), ForwardError> {
        if self.forwards.contains_key(&local_port) {
            warn!(local_port, "port already forwarded, stopping old forward");
            self.stop_forward(local_port).await;
        }

        let listener = TcpListener::bind(("0.0.0.0", local_port))
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AddrInUse {
                    ForwardError::AddrInUse(local_port)
                } else {
                    ForwardError::Bind {
                        port: local_port,
                        source: err,
                    }
                }
            })?;

        let target_host = target_host.to_string();
        let target = format!("{}:{}", target_host, target_port);
        info!(local_port, %target, "forwarding started");

        let task_target = target.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((client, peer)) => {
                        debug!(%peer, target = %task_target, "accepted connection");
                        let host = target_host.clone();
                        tokio::spawn(async move {
                            handle_client(client, host, target_port).await;
                        });
                    }
                    Err(err) => {
                        error!(local_port, error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        });

        self.forwards.insert(local_port, Forward { task, target });
        Ok(())
    }

    pub async fn stop_forward(&mut self, local_port: u16) {
        if let Some(forward) = self.forwards.remove(&local_port) {
            forward.task.abort();
            let _ = forward.task.await;
            info!(local_port, target = %forward.target, "forwarding stopped");
        }
    }

    pub fn is_forwarding(&self, local_port: u16) -> bool {
        self.forwards.contains_key(&local_port)
    }

    pub fn forwarding_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.forwards.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn cleanup_all(&mut self) {
        let ports = self.forwarding_ports();
        for port in ports {
            self.stop_forward(port).await;
        }
    }
}

async fn handle_client(client: TcpStream, target_host: String, target_port: u16) {
    let dial = tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((target_host.as_str(), target_port)),
    )
    .await;

    let upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(target = %format!("{}:{}", target_host, target_port), error = %err, "dial failed");
            return;
        }
        Err(_) => {
            warn!(target = %format!("{}:{}", target_host, target_port), "dial timed out");
            return;
        }
    };

    set_keepalive(&upstream);
    set_keepalive(&client);

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let forward = copy_with_idle_probe(client_read, upstream_write, "client->target");
    let backward = copy_with_idle_probe(upstream_read, client_write, "target->client");

    // Both halves close on the first hard error from either direction.
    let _ = tokio::join!(forward, backward);
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10))
        .with_retries(3);
    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %err, "failed to set TCP keepalive");
    }
}

async fn copy_with_idle_probe(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    direction: &'static str,
) {
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    debug!(direction, error = %err, "write failed");
                    break;
                }
            }
            Ok(Err(err)) => {
                debug!(direction, error = %err, "read failed");
                break;
            }
            Err(_) => {
                // Idle, not dead: probe the write side and keep waiting.
                match tokio::time::timeout(Duration::from_secs(1), writer.writable()).await {
                    Ok(Ok(())) => continue,
                    _ => {
                        debug!(direction, "peer gone during idle probe");
                        break;
                    }
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_bytes_end_to_end() {
        // Echo server as the target.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match target.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        // Pick a free local port by binding and dropping.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut forwarder = PortForwarder::new();
        forwarder
            .start_forward(local_port, "127.0.0.1", target_port)
            .await
            .unwrap();
        assert!(forwarder.is_forwarding(local_port));

        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"ping through relay").await.unwrap();
        let mut response = [0u8; 18];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"ping through relay");

        forwarder.cleanup_all().await;
        assert!(forwarder.forwarding_ports().is_empty());
    }

    #[tokio::test]
    async fn bind_conflict_is_a_specific_diagnostic() {
        let holder = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut forwarder = PortForwarder::new();
        let err = forwarder
            .start_forward(port, "127.0.0.1", 9)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::AddrInUse(p) if p == port));
        assert!(err.to_string().contains("already in use"));
    }
}
