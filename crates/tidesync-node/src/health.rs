//! Health check HTTP endpoint
//!
//! A minimal HTTP/1.1 responder for liveness and readiness probes:
//!
//! - `GET /health`: node status JSON (tasks, stage states, relay depths, idle
//!   seconds); 503 when a working task has a stage that is not running
//! - `GET /ready`: 200 once the node context is open
//! - `GET /live`: always 200

use crate::config::HealthConfig;
use crate::lifecycle::{LifecycleController, NodeStatus};
use crate::stage::StageState;
use std::net::SocketAddr;
use std::sync::Arc;
use tidesync_common::TaskState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether every working task has all of its stages running
pub fn is_healthy(status: &NodeStatus) -> bool {
    status
        .tasks
        .iter()
        .filter(|task| task.state == TaskState::Working)
        .all(|task| {
            task.stages.as_ref().map_or(true, |stages| {
                stages.iter().all(|stage| stage.state == StageState::Running)
            })
        })
}

/// Bind and serve the health endpoint until shutdown
pub async fn start_health_server(
    config: HealthConfig,
    controller: Arc<LifecycleController>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if !config.enabled {
        debug!("Health check endpoint disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Health check endpoint listening on http://{}/health", addr);

    serve_health(listener, controller, shutdown).await
}

/// Serve health requests on an already bound listener
pub async fn serve_health(
    listener: TcpListener,
    controller: Arc<LifecycleController>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (mut socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let controller = Arc::clone(&controller);

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            match socket.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let Some(line) = request.lines().next() else {
                        return;
                    };
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() < 2 {
                        return;
                    }
                    let (method, path) = (parts[0], parts[1]);
                    debug!("Health check request: {} {} from {}", method, path, peer);

                    let response = match (method, path) {
                        ("GET", "/health") => health_response(&controller),
                        ("GET", "/ready") => ready_response(&controller),
                        ("GET", "/live") => response(200, "OK", r#"{"status":"alive"}"#),
                        _ => response(404, "Not Found", r#"{"error":"not found"}"#),
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        warn!("Failed to send health response: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Health check socket error: {}", e),
            }
        });
    }
}

fn health_response(controller: &LifecycleController) -> String {
    let status = controller.snapshot();
    let healthy = is_healthy(&status);
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "node": status,
    });
    let body = serde_json::to_string_pretty(&body).unwrap_or_default();
    if healthy {
        response(200, "OK", &body)
    } else {
        response(503, "Service Unavailable", &body)
    }
}

fn ready_response(controller: &LifecycleController) -> String {
    let ready = !controller.node().is_closed();
    let body = serde_json::json!({ "ready": ready }).to_string();
    if ready {
        response(200, "OK", &body)
    } else {
        response(503, "Service Unavailable", &body)
    }
}

fn response(code: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectorRegistry;
    use crate::context::NodeContext;
    use tidesync_common::NodeId;
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_endpoints() {
        let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
        let (controller, _alarms) = LifecycleController::new(ctx.clone(), ConnectorRegistry::with_builtins());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_health(listener, controller, shutdown.clone()));

        let live = get(addr, "/live").await;
        assert!(live.starts_with("HTTP/1.1 200 OK"));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        assert!(health.contains("\"node_id\": \"node-a\""));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        ctx.teardown();
        assert!(get(addr, "/ready").await.starts_with("HTTP/1.1 503"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
