use crate::runtime::observer;
use crate::time::Clock;
use crate::toolkit::simulator::SimulatedCluster;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Start a minimal HTTP endpoint serving the health report, liveness, and loglevel controls.
pub async fn start_http<C: Clock>(
    bind: &str,
    cluster: Arc<SimulatedCluster<C>>,
    log_handle: Option<LogHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind telemetry endpoint on {bind}"))?;
    let local = listener.local_addr().context("telemetry local address")?;
    tracing::info!("telemetry endpoint listening on {}", local);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((mut socket, _addr)) => {
                        let cluster = cluster.clone();
                        let log_handle = log_handle.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_conn(&mut socket, cluster, log_handle).await {
                                tracing::warn!("telemetry handler error: {err:?}");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!("telemetry accept error: {err:?}");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    });
    Ok(local)
}

async fn handle_conn<C: Clock>(
    socket: &mut tokio::net::TcpStream,
    cluster: Arc<SimulatedCluster<C>>,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let target = first.split_whitespace().nth(1).unwrap_or("/");
    let (route, query) = target.split_once('?').unwrap_or((target, ""));
    let (status, body, content_type) = match route {
        "/healthz" => healthz(&cluster),
        "/livez" => livez(&cluster),
        "/v1/loglevel" => loglevel(log_handle.as_ref(), query),
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Service Unavailable",
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

/// Health report as seen by the leader (or any running node). 503 without a leader.
pub fn healthz<C: Clock>(cluster: &SimulatedCluster<C>) -> (u16, String, &'static str) {
    match observer(cluster) {
        Some(engine) => {
            let report = engine.health_report();
            let code = if report.leader.is_some() { 200 } else { 503 };
            (code, report.to_json(), "application/json")
        }
        None => (
            503,
            "{\"error\":\"no running node\"}".to_string(),
            "application/json",
        ),
    }
}

pub fn livez<C: Clock>(cluster: &SimulatedCluster<C>) -> (u16, String, &'static str) {
    let running = cluster.running().len();
    let live = running > 0;
    let code = if live { 200 } else { 503 };
    let body = format!(
        "{{\"live\":{},\"running\":{},\"nodes\":{}}}",
        live,
        running,
        cluster.ids().len()
    );
    (code, body, "application/json")
}

fn loglevel(log_handle: Option<&LogHandle>, query: &str) -> (u16, String, &'static str) {
    let Some(level) = query.split('&').find_map(|p| p.strip_prefix("level=")) else {
        return (
            400,
            "{\"error\":\"missing level\"}".to_string(),
            "application/json",
        );
    };
    let Ok(filter) = EnvFilter::try_new(level) else {
        return (
            400,
            format!("{{\"error\":\"invalid level {level}\"}}"),
            "application/json",
        );
    };
    if let Some(handle) = log_handle {
        if let Err(err) = handle.modify(|f| *f = filter) {
            tracing::warn!("log level reload failed: {err}");
        } else {
            tracing::info!(level, "log level changed");
        }
    }
    (200, "{\"status\":\"ok\"}".to_string(), "application/json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn healthz_requires_a_leader() {
        let cluster = SimulatedCluster::with_nodes(&["a", "b", "c"], SystemClock).unwrap();
        let (code, _, _) = healthz(&cluster);
        assert_eq!(code, 503);
        cluster.elect(&"a".into()).await.unwrap();
        let (code, body, _) = healthz(&cluster);
        assert_eq!(code, 200);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["leader"], "a");
    }

    #[tokio::test]
    async fn livez_counts_running_nodes() {
        let cluster = SimulatedCluster::with_nodes(&["a", "b"], SystemClock).unwrap();
        cluster.crash(&"b".into());
        let (code, body, _) = livez(&cluster);
        assert_eq!(code, 200);
        assert!(body.contains("\"running\":1"));
        let (code, _, _) = loglevel(None, "level=debug");
        assert_eq!(code, 200);
        let (code, _, _) = loglevel(None, "");
        assert_eq!(code, 400);
    }
}
