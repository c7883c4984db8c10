use crate::config::{ClusterNodeConfig, Config};
use crate::consensus::ProposalValue;
use crate::core::engine::CoordinationEngine;
use crate::membership::MembershipEvent;
use crate::ops::health::HealthReport;
use crate::telemetry;
use crate::telemetry::LogHandle;
use crate::time::Clock;
use crate::toolkit::simulator::SimulatedCluster;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Process scaffold: hosts the configured cluster in-process, drives every node's timers,
/// serves the telemetry endpoint, and coordinates shutdown.
pub struct Runtime<C: Clock> {
    config: Config,
    cluster: Arc<SimulatedCluster<C>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl<C: Clock> Runtime<C> {
    /// An empty `cluster.nodes` runs `node.id` as a single-node cluster.
    pub fn new(mut config: Config, clock: C, log_handle: Option<LogHandle>) -> Result<Self> {
        config.validate()?;
        if config.cluster.nodes.is_empty() {
            config.cluster.nodes.push(ClusterNodeConfig::named(config.node.id.clone()));
        }
        let cluster = Arc::new(SimulatedCluster::new(&config, clock).context("build cluster")?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            cluster,
            tasks: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    /// Start background loops and telemetry, then wait for shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start_background();
        self.start_telemetry().await?;
        tracing::info!(nodes = self.cluster.ids().len(), "runtime started");
        self.handle_shutdown().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cluster(&self) -> Arc<SimulatedCluster<C>> {
        self.cluster.clone()
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    pub fn health_report(&self) -> Option<HealthReport> {
        observer(&self.cluster).map(|engine| engine.health_report())
    }

    /// Per node: consensus timer, heartbeat probes, and the slower maintenance cycle.
    /// One cluster-wide loop logs the health report.
    pub fn start_background(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let engines: Vec<Arc<CoordinationEngine<C>>> = self.cluster.engines().cloned().collect();
        for engine in engines {
            self.spawn_event_watch(engine.clone());
            let consensus = engine.consensus().clone();
            let heartbeat = engine.config().consensus.heartbeat_interval();
            self.spawn_loop("consensus", heartbeat, move || {
                let consensus = consensus.clone();
                async move {
                    consensus.tick().await;
                    if consensus.is_leader() {
                        consensus.send_heartbeats().await;
                    }
                }
            });

            let probe_engine = engine.clone();
            let probe_interval = engine.config().fault.heartbeat_interval();
            self.spawn_loop("probe", probe_interval, move || {
                let engine = probe_engine.clone();
                async move {
                    let report = engine.fault().probe_round().await;
                    engine.handle_probe_report(&report).await;
                }
            });

            let maintenance = engine.config().fault.redundancy_interval();
            self.spawn_loop("maintenance", maintenance, move || {
                let engine = engine.clone();
                async move {
                    match engine.run_maintenance().await {
                        Ok(report) => tracing::debug!(
                            node = %engine.local_id(),
                            repaired = report.sync.repaired,
                            gaps = report.redundancy.gaps.len(),
                            "maintenance cycle"
                        ),
                        Err(err) => tracing::warn!(node = %engine.local_id(), error = %err, "maintenance failed"),
                    }
                }
            });
        }

        let cluster = self.cluster.clone();
        let health_interval = Duration::from_millis(self.config.telemetry.health_interval_ms.max(1));
        self.spawn_loop("health", health_interval, move || {
            let cluster = cluster.clone();
            async move {
                if let Some(report) = observer(&cluster).map(|e| e.health_report()) {
                    tracing::info!(
                        overall_health = report.overall_health,
                        leader = ?report.leader,
                        term = report.term,
                        alerts = report.alerts.len(),
                        "cluster health"
                    );
                }
            }
        });
    }

    /// Rebuild the node's topology when live membership changes, whether seen locally or
    /// through a committed membership entry, and trace every applied entry.
    fn spawn_event_watch(&mut self, engine: Arc<CoordinationEngine<C>>) {
        let mut membership = engine.membership().subscribe();
        let mut applied = engine.consensus().core().subscribe_applied();
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let refresh = tokio::select! {
                    event = membership.recv() => match event {
                        Ok(MembershipEvent::StatusChanged { from, to, .. }) => from.is_live() != to.is_live(),
                        Ok(MembershipEvent::Registered(_) | MembershipEvent::Deregistered(_)) => true,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(node = %engine.local_id(), skipped, "membership events lagged");
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = applied.recv() => match event {
                        Ok(event) => {
                            tracing::debug!(
                                node = %engine.local_id(),
                                term = event.term,
                                index = event.index,
                                proposal = %event.proposal_id,
                                "entry applied"
                            );
                            matches!(event.value, ProposalValue::MembershipChange(_))
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(node = %engine.local_id(), skipped, "apply events lagged");
                            false
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                };
                if refresh {
                    engine.refresh_topology_logged();
                }
            }
            tracing::debug!(task = "events", "background loop stopped");
        }));
    }

    fn spawn_loop<F, Fut>(&mut self, name: &'static str, period: Duration, mut step: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => step().await,
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!(task = name, "background loop stopped");
        }));
    }

    pub async fn start_telemetry(&self) -> Result<()> {
        if let Some(bind) = &self.config.telemetry.http_bind {
            telemetry::start_http(
                bind,
                self.cluster.clone(),
                self.log_handle(),
                self.shutdown_rx.clone(),
            )
            .await?;
        }
        Ok(())
    }

    /// Signal every background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn handle_shutdown(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        self.drain().await
    }

    async fn drain(&mut self) -> Result<()> {
        tracing::info!(tasks = self.tasks.len(), "draining background tasks");
        for handle in self.tasks.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!("background task ended abnormally: {err:?}");
            }
        }
        Ok(())
    }

    /// Stop background tasks without waiting for SIGINT.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        self.shutdown();
        self.drain().await
    }
}

/// Engine whose view is reported: the leader, else the first running node.
pub(crate) fn observer<C: Clock>(cluster: &SimulatedCluster<C>) -> Option<Arc<CoordinationEngine<C>>> {
    cluster.leader().or_else(|| cluster.running().into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[tokio::test]
    async fn background_loops_elect_a_leader_and_stop_on_shutdown() {
        let mut config = Config::for_node("a");
        config.cluster.nodes = ["a", "b", "c"].into_iter().map(ClusterNodeConfig::named).collect();
        let mut runtime = Runtime::new(config, SystemClock, None).unwrap();
        runtime.start_background();
        let cluster = runtime.cluster();
        let mut leader = None;
        for _ in 0..100 {
            if let Some(engine) = cluster.leader() {
                leader = Some(engine.local_id().clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(leader.is_some());
        assert!(runtime.health_report().is_some());
        runtime.shutdown_for_tests().await.unwrap();
    }

    #[tokio::test]
    async fn status_change_rebuilds_the_topology() {
        let mut config = Config::for_node("a");
        config.cluster.nodes = ["a", "b", "c"].into_iter().map(ClusterNodeConfig::named).collect();
        let mut runtime = Runtime::new(config, SystemClock, None).unwrap();
        runtime.start_background();
        let engine = runtime.cluster().engine(&"a".into()).unwrap();
        engine
            .membership()
            .set_status(&"c".into(), crate::membership::NodeStatus::Quarantined)
            .unwrap();
        let mut rebuilt = false;
        for _ in 0..50 {
            if engine
                .topology()
                .map_or(false, |t| !t.topology.nodes.contains(&"c".into()))
            {
                rebuilt = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rebuilt);
        runtime.shutdown_for_tests().await.unwrap();
    }

    #[tokio::test]
    async fn empty_cluster_runs_the_local_node() {
        let runtime = Runtime::new(Config::for_node("solo"), SystemClock, None).unwrap();
        assert_eq!(runtime.cluster().ids(), vec![crate::membership::NodeId::from("solo")]);
    }
}
