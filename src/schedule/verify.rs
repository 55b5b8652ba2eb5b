//! Schedule invariants.
//!
//! Run on every schedule a strategy produces and on every schedule read
//! back from an artifact.

use super::graph::DependencyGraph;
use super::Schedule;
use crate::config::{ResourceKind, ResourceVector};

/// Check that `schedule` is a legal modulo schedule of `graph`:
///
/// - II >= 1 and every node has a cycle;
/// - `cycle(to) + d * II >= cycle(from) + weight` for every edge;
/// - per phase, summed usage fits the inventory;
/// - the earliest stage is 0.
pub fn verify_schedule(
    graph: &DependencyGraph,
    schedule: &Schedule,
    inventory: &ResourceVector,
) -> Result<(), String> {
    let ii = schedule.initiation_interval;
    if ii == 0 {
        return Err("initiation interval is 0".to_string());
    }
    if schedule.cycles.len() != graph.len() {
        return Err(format!(
            "schedule covers {} nodes, graph has {}",
            schedule.cycles.len(),
            graph.len()
        ));
    }

    for e in &graph.edges {
        let from = schedule.cycles[e.from] as i64;
        let to = schedule.cycles[e.to] as i64;
        if to < from + e.delay(ii) {
            return Err(format!(
                "edge '{}' -> '{}' violated: {} + {}*{} < {} + {}",
                graph.nodes[e.from].name,
                graph.nodes[e.to].name,
                to,
                e.distance,
                ii,
                from,
                e.weight
            ));
        }
    }

    let mut table = vec![ResourceVector::ZERO; ii as usize];
    for (i, node) in graph.nodes.iter().enumerate() {
        let phase = schedule.phase(i) as usize;
        table[phase] = table[phase].add(&node.usage);
    }
    for (phase, used) in table.iter().enumerate() {
        if !used.fits(inventory) {
            let over = ResourceKind::ALL
                .iter()
                .find(|&&k| used.get(k) > inventory.get(k))
                .map(|k| k.name())
                .unwrap_or("?");
            return Err(format!(
                "phase {} oversubscribes {}: {} > {}",
                phase, over, used, inventory
            ));
        }
    }

    if !schedule.cycles.is_empty() && schedule.cycles.iter().all(|&c| c >= ii) {
        return Err("earliest stage is not 0".to_string());
    }
    Ok(())
}
