use super::simulator::SimulatedCluster;
use crate::config::{ClusterNodeConfig, Config};
use crate::consensus::ProposalValue;
use crate::core::engine::{CoordinationEngine, ReplicateRequest};
use crate::membership::NodeId;
use crate::replication::{ConflictStrategy, ConsistencyLevel, ItemId};
use crate::time::{Clock, SystemClock};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChaosScenario {
    pub name: String,
    /// Overrides `cluster.nodes` from the base config when non-empty.
    #[serde(default)]
    pub nodes: Vec<String>,
    pub steps: Vec<ChaosStep>,
}

/// One scripted action. Steps taking `via` run on that node; without it they run on the
/// current leader, or the first running node when there is none.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChaosStep {
    Crash {
        node: String,
    },
    Restart {
        node: String,
    },
    Partition {
        groups: Vec<Vec<String>>,
    },
    Heal,
    Latency {
        node: String,
        latency_ms: u64,
    },
    ClearLatency {
        node: String,
    },
    /// Force an election on `node`, or wait for any leader.
    Elect {
        #[serde(default)]
        node: Option<String>,
        #[serde(default = "default_leader_wait_ms")]
        within_ms: u64,
    },
    Write {
        key: String,
        value: String,
        #[serde(default)]
        consistency: Option<ConsistencyLevel>,
        #[serde(default)]
        via: Option<String>,
    },
    Read {
        key: String,
        #[serde(default)]
        expect: Option<String>,
        #[serde(default)]
        consistency: Option<ConsistencyLevel>,
        #[serde(default)]
        via: Option<String>,
    },
    Propose {
        key: String,
        value: String,
        #[serde(default)]
        via: Option<String>,
    },
    /// One maintenance cycle on every running node.
    Maintain,
    HandleFailure {
        node: String,
        #[serde(default)]
        via: Option<String>,
    },
    ResolveConflict {
        key: String,
        #[serde(default)]
        strategy: Option<ConflictStrategy>,
        #[serde(default)]
        via: Option<String>,
    },
    Wait {
        ms: u64,
    },
}

fn default_leader_wait_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: ChaosStep,
    pub ok: bool,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub steps: Vec<StepReport>,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub overall_health: f64,
    pub alerts: usize,
}

pub fn load_scenarios(path: &Path) -> Result<Vec<ChaosScenario>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_slice(&bytes).context("decode chaos scenario")?;
    if value.is_array() {
        serde_json::from_value(value).context("decode chaos scenario list")
    } else {
        Ok(vec![serde_json::from_value(value).context("decode chaos scenario")?])
    }
}

/// Run each scenario against a fresh in-process cluster built from `config`.
pub async fn run_scenarios(config: &Config, scenarios: &[ChaosScenario]) -> Result<Vec<ScenarioReport>> {
    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        reports.push(run_scenario(config, scenario).await?);
    }
    Ok(reports)
}

pub async fn run_scenario(config: &Config, scenario: &ChaosScenario) -> Result<ScenarioReport> {
    let mut config = config.clone();
    if !scenario.nodes.is_empty() {
        config.cluster.nodes = scenario.nodes.iter().map(ClusterNodeConfig::named).collect();
    }
    let cluster = SimulatedCluster::new(&config, SystemClock)
        .with_context(|| format!("build cluster for scenario {}", scenario.name))?;
    tracing::info!(scenario = %scenario.name, steps = scenario.steps.len(), "chaos scenario started");
    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.iter().enumerate() {
        let (ok, detail) = match run_step(&cluster, step).await {
            Ok(detail) => (true, detail),
            Err(err) => (false, json!({ "error": format!("{err:#}") })),
        };
        if !ok {
            tracing::warn!(scenario = %scenario.name, index, detail = %detail, "chaos step failed");
        }
        steps.push(StepReport {
            index,
            step: step.clone(),
            ok,
            detail,
        });
    }
    let observer = target(&cluster, None)?;
    let health = observer.health_report();
    Ok(ScenarioReport {
        name: scenario.name.clone(),
        passed: steps.iter().all(|s| s.ok),
        steps,
        leader: health.leader.clone(),
        term: health.term,
        overall_health: health.overall_health,
        alerts: cluster.engines().map(|e| e.alerts().len()).sum(),
    })
}

fn target<C: Clock>(cluster: &SimulatedCluster<C>, via: Option<&str>) -> Result<Arc<CoordinationEngine<C>>> {
    match via {
        Some(id) => cluster
            .engine(&NodeId::from(id))
            .ok_or_else(|| anyhow!("unknown node {id}")),
        None => cluster
            .leader()
            .or_else(|| cluster.running().into_iter().next())
            .ok_or_else(|| anyhow!("no running node")),
    }
}

async fn run_step<C: Clock>(cluster: &SimulatedCluster<C>, step: &ChaosStep) -> Result<Value> {
    match step {
        ChaosStep::Crash { node } => Ok(json!({ "crashed": cluster.crash(&node.as_str().into()) })),
        ChaosStep::Restart { node } => Ok(json!({ "restarted": cluster.restart(&node.as_str().into()) })),
        ChaosStep::Partition { groups } => {
            let groups: Vec<Vec<NodeId>> = groups
                .iter()
                .map(|g| g.iter().map(|n| NodeId::from(n.as_str())).collect())
                .collect();
            cluster.partition(&groups);
            Ok(json!({ "groups": groups.len() }))
        }
        ChaosStep::Heal => {
            cluster.heal();
            Ok(Value::Null)
        }
        ChaosStep::Latency { node, latency_ms } => {
            cluster.set_latency(&node.as_str().into(), Duration::from_millis(*latency_ms));
            Ok(Value::Null)
        }
        ChaosStep::ClearLatency { node } => {
            cluster.clear_latency(&node.as_str().into());
            Ok(Value::Null)
        }
        ChaosStep::Elect { node, within_ms } => {
            if let Some(node) = node {
                let outcome = cluster
                    .elect(&node.as_str().into())
                    .await
                    .ok_or_else(|| anyhow!("unknown node {node}"))?;
                if !outcome.won {
                    return Err(anyhow!(
                        "{node} lost election for term {} ({}/{} votes)",
                        outcome.term,
                        outcome.votes_granted,
                        outcome.votes_needed
                    ));
                }
                return Ok(serde_json::to_value(outcome)?);
            }
            let leader = cluster
                .wait_for_leader(Duration::from_millis(*within_ms))
                .await
                .ok_or_else(|| anyhow!("no leader within {within_ms}ms"))?;
            Ok(json!({ "leader": leader }))
        }
        ChaosStep::Write {
            key,
            value,
            consistency,
            via,
        } => {
            let engine = target(cluster, via.as_deref())?;
            let mut request = ReplicateRequest::new(key.as_str(), value.as_bytes().to_vec());
            request.consistency = *consistency;
            let response = engine.replicate(request).await?;
            if !response.strategy_satisfied {
                return Err(anyhow!(
                    "write reached {} replicas, unreachable {:?}",
                    response.replicas_achieved,
                    response.unreachable_nodes
                ));
            }
            Ok(json!({
                "version": response.version,
                "fully_replicated": response.success,
                "replicas": response.replicas_achieved,
                "attempts": response.attempts,
                "committed_index": response.committed_index,
            }))
        }
        ChaosStep::Read {
            key,
            expect,
            consistency,
            via,
        } => {
            let engine = target(cluster, via.as_deref())?;
            let outcome = engine.read(&ItemId::from(key.as_str()), *consistency).await?;
            let value = String::from_utf8_lossy(&outcome.item.content).into_owned();
            if let Some(expected) = expect {
                if expected != &value {
                    return Err(anyhow!("read {key}: expected {expected:?}, got {value:?}"));
                }
            }
            Ok(json!({
                "value": value,
                "version": outcome.item.version(),
                "answered": outcome.answered,
            }))
        }
        ChaosStep::Propose { key, value, via } => {
            let engine = target(cluster, via.as_deref())?;
            let response = engine
                .propose(ProposalValue::ConfigChange {
                    key: key.clone(),
                    value: value.clone(),
                })
                .await?;
            Ok(serde_json::to_value(response)?)
        }
        ChaosStep::Maintain => {
            let mut detected = Vec::new();
            for engine in cluster.running() {
                let report = engine.run_maintenance().await?;
                detected.extend(report.probe.newly_failed.into_iter().map(|f| f.node_id));
            }
            detected.sort();
            detected.dedup();
            Ok(json!({ "newly_failed": detected }))
        }
        ChaosStep::HandleFailure { node, via } => {
            let engine = target(cluster, via.as_deref())?;
            let handling = engine.handle_failure(&node.as_str().into()).await?;
            Ok(serde_json::to_value(handling)?)
        }
        ChaosStep::ResolveConflict { key, strategy, via } => {
            let engine = target(cluster, via.as_deref())?;
            let result = engine
                .resolve_conflict(
                    &ItemId::from(key.as_str()),
                    strategy.unwrap_or(ConflictStrategy::LastWriteWins),
                )
                .await?;
            Ok(serde_json::to_value(result)?)
        }
        ChaosStep::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Ok(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_json_decodes() {
        let raw = r#"{
            "name": "leader-loss",
            "nodes": ["a", "b", "c"],
            "steps": [
                {"action": "elect", "node": "a"},
                {"action": "write", "key": "k", "value": "v1", "consistency": "strong"},
                {"action": "crash", "node": "a"},
                {"action": "wait", "ms": 50},
                {"action": "read", "key": "k", "expect": "v1", "via": "b"}
            ]
        }"#;
        let scenario: ChaosScenario = serde_json::from_str(raw).unwrap();
        assert_eq!(scenario.steps.len(), 5);
        assert!(matches!(scenario.steps[0], ChaosStep::Elect { within_ms: 3_000, .. }));
        assert!(matches!(
            scenario.steps[1],
            ChaosStep::Write { consistency: Some(ConsistencyLevel::Strong), .. }
        ));
    }

    #[tokio::test]
    async fn write_survives_leader_crash() {
        let scenario = ChaosScenario {
            name: "leader-crash".into(),
            nodes: vec!["a".into(), "b".into(), "c".into()],
            steps: vec![
                ChaosStep::Elect {
                    node: Some("a".into()),
                    within_ms: 1_000,
                },
                ChaosStep::Write {
                    key: "k".into(),
                    value: "v1".into(),
                    consistency: Some(ConsistencyLevel::Strong),
                    via: None,
                },
                ChaosStep::Crash { node: "a".into() },
                ChaosStep::Read {
                    key: "k".into(),
                    expect: Some("v1".into()),
                    consistency: Some(ConsistencyLevel::Eventual),
                    via: Some("b".into()),
                },
            ],
        };
        let reports = run_scenarios(&Config::default(), &[scenario]).await.unwrap();
        let report = &reports[0];
        assert!(report.passed, "{:?}", report.steps);
        assert_eq!(report.steps.len(), 4);
    }
}
