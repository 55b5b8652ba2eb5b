//! Schedule artifacts: dump a computed schedule to JSON and replay it later
//! instead of searching again.
//!
//! Replay is exact. The artifact names every node and edge of the graph it
//! was computed for, plus a blake3 fingerprint over both; any mismatch with
//! the current graph is a `MalformedScheduleFile` error, never a silent
//! re-schedule.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::graph::{DependencyGraph, Edge};
use super::verify::verify_schedule;
use super::Schedule;
use crate::config::{ResourceKind, ResourceVector};
use crate::error::ScheduleError;

pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactNode {
    /// Handle in the compacted body copy.
    pub id: u32,
    pub name: String,
    pub kind: String,
    pub cycle: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleArtifact {
    pub version: u32,
    pub loop_name: String,
    pub body: String,
    pub fingerprint: String,
    pub initiation_interval: u32,
    pub num_stages: u32,
    /// Column names of every `reservations` row.
    pub resources: Vec<String>,
    pub nodes: Vec<ArtifactNode>,
    pub edges: Vec<Edge>,
    /// Units reserved per resource, one row per phase.
    pub reservations: Vec<Vec<u32>>,
}

impl ScheduleArtifact {
    pub fn new(loop_name: &str, graph: &DependencyGraph, schedule: &Schedule) -> Self {
        let nodes = graph
            .nodes
            .iter()
            .zip(&schedule.cycles)
            .map(|(n, &cycle)| ArtifactNode {
                id: n.copy_id.0,
                name: n.name.clone(),
                kind: n.kind.to_string(),
                cycle,
            })
            .collect();
        Self {
            version: ARTIFACT_VERSION,
            loop_name: loop_name.to_string(),
            body: graph.body.clone(),
            fingerprint: graph.fingerprint(),
            initiation_interval: schedule.initiation_interval,
            num_stages: schedule.num_stages(),
            resources: ResourceKind::names(),
            nodes,
            edges: graph.edges.clone(),
            reservations: reservation_rows(graph, schedule),
        }
    }

    pub fn schedule(&self) -> Schedule {
        Schedule {
            cycles: self.nodes.iter().map(|n| n.cycle).collect(),
            initiation_interval: self.initiation_interval,
        }
    }

    /// Check that the artifact describes exactly `graph`.
    fn matches(&self, graph: &DependencyGraph) -> Result<(), String> {
        if self.version != ARTIFACT_VERSION {
            return Err(format!(
                "format version {} (expected {})",
                self.version, ARTIFACT_VERSION
            ));
        }
        if self.body != graph.body {
            return Err(format!(
                "artifact is for body '{}', not '{}'",
                self.body, graph.body
            ));
        }
        if self.resources != ResourceKind::names() {
            return Err(format!("unknown resource columns {:?}", self.resources));
        }
        if self.nodes.len() != graph.len() {
            return Err(format!(
                "artifact has {} nodes, graph has {}",
                self.nodes.len(),
                graph.len()
            ));
        }
        for (stored, node) in self.nodes.iter().zip(&graph.nodes) {
            if stored.id != node.copy_id.0 || stored.name != node.name || stored.kind != node.kind {
                return Err(format!(
                    "node {} is '{}' ({}) in the artifact but '{}' ({}) in the graph",
                    stored.id, stored.name, stored.kind, node.name, node.kind
                ));
            }
        }
        if self.edges != graph.edges {
            return Err(format!(
                "artifact has {} edges that do not match the graph's {}",
                self.edges.len(),
                graph.edges.len()
            ));
        }
        let fingerprint = graph.fingerprint();
        if self.fingerprint != fingerprint {
            return Err(format!(
                "fingerprint {} does not match graph fingerprint {}",
                self.fingerprint, fingerprint
            ));
        }
        Ok(())
    }
}

/// Per-phase reservation table as plain rows.
pub(crate) fn reservation_rows(graph: &DependencyGraph, schedule: &Schedule) -> Vec<Vec<u32>> {
    let mut table = vec![ResourceVector::ZERO; schedule.initiation_interval as usize];
    for (i, node) in graph.nodes.iter().enumerate() {
        let phase = schedule.phase(i) as usize;
        table[phase] = table[phase].add(&node.usage);
    }
    table.iter().map(|row| row.0.to_vec()).collect()
}

pub fn dump_schedule(
    path: &Path,
    loop_name: &str,
    graph: &DependencyGraph,
    schedule: &Schedule,
) -> Result<(), ScheduleError> {
    let artifact = ScheduleArtifact::new(loop_name, graph, schedule);
    let json = serde_json::to_string_pretty(&artifact).map_err(|source| ScheduleError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ScheduleError::io(parent, e))?;
    }
    fs::write(path, json).map_err(|e| ScheduleError::io(path, e))?;
    debug!(path = %path.display(), loop_name, "dumped schedule");
    Ok(())
}

pub fn read_artifact(path: &Path) -> Result<ScheduleArtifact, ScheduleError> {
    let text = fs::read_to_string(path).map_err(|e| ScheduleError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| ScheduleError::malformed_file(path, e.to_string()))
}

/// Load an artifact and check it against `graph` and `inventory`.
pub fn load_schedule(
    path: &Path,
    graph: &DependencyGraph,
    inventory: &ResourceVector,
) -> Result<Schedule, ScheduleError> {
    let artifact = read_artifact(path)?;
    artifact
        .matches(graph)
        .map_err(|reason| ScheduleError::malformed_file(path, reason))?;
    let schedule = artifact.schedule();
    verify_schedule(graph, &schedule, inventory)
        .map_err(|reason| ScheduleError::malformed_file(path, reason))?;
    if schedule.num_stages() != artifact.num_stages {
        return Err(ScheduleError::malformed_file(
            path,
            format!(
                "records {} stages but its cycles span {}",
                artifact.num_stages,
                schedule.num_stages()
            ),
        ));
    }
    Ok(schedule)
}
