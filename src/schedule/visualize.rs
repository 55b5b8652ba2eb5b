//! Human-readable schedule dumps: a Graphviz DOT file of the dependency
//! graph and a text modulo reservation table.

use std::fs;
use std::path::{Path, PathBuf};

use super::artifact::reservation_rows;
use super::graph::{DependencyGraph, EdgeKind};
use super::Schedule;
use crate::config::{ResourceKind, ResourceVector};
use crate::error::ScheduleError;

/// Nodes are labelled with their cycle and stage; carried edges are dashed.
pub fn to_dot(graph: &DependencyGraph, schedule: &Schedule) -> String {
    let mut dot = format!("digraph \"{}\" {{\n", graph.body);
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box];\n\n");

    for (i, node) in graph.nodes.iter().enumerate() {
        dot.push_str(&format!(
            "  n{} [label=\"{}\\n{}\\ncycle {} stage {}\"];\n",
            i,
            node.name,
            node.kind,
            schedule.cycles[i],
            schedule.stage(i)
        ));
    }
    dot.push('\n');
    for e in &graph.edges {
        let style = match e.kind {
            EdgeKind::Data => "solid",
            EdgeKind::Memory => "dotted",
            EdgeKind::Recurrence => "dashed",
        };
        dot.push_str(&format!(
            "  n{} -> n{} [label=\"{}/{}\", style={}];\n",
            e.from, e.to, e.weight, e.distance, style
        ));
    }
    dot.push_str("}\n");
    dot
}

/// One row per phase: units in use out of the inventory, then the nodes
/// issuing in that phase.
pub fn reservation_table(
    graph: &DependencyGraph,
    schedule: &Schedule,
    inventory: &ResourceVector,
) -> String {
    let rows = reservation_rows(graph, schedule);
    let mut out = format!(
        "{} II={} stages={}\n",
        graph.body,
        schedule.initiation_interval,
        schedule.num_stages()
    );
    out.push_str("phase");
    for kind in ResourceKind::ALL {
        out.push_str(&format!(" {:>15}", kind.name()));
    }
    out.push_str("  nodes\n");
    for (phase, row) in rows.iter().enumerate() {
        out.push_str(&format!("{:>5}", phase));
        for kind in ResourceKind::ALL {
            let used = format!("{}/{}", row[kind as usize], inventory.get(kind));
            out.push_str(&format!(" {:>15}", used));
        }
        let names: Vec<String> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|&(i, _)| schedule.phase(i) as usize == phase)
            .map(|(i, n)| format!("{}@{}", n.name, schedule.cycles[i]))
            .collect();
        out.push_str(&format!("  {}\n", names.join(" ")));
    }
    out
}

/// Write `<body>.dot` and `<body>.mrt.txt` into `dir`.
pub fn write_visualization(
    dir: &Path,
    graph: &DependencyGraph,
    schedule: &Schedule,
    inventory: &ResourceVector,
) -> Result<Vec<PathBuf>, ScheduleError> {
    fs::create_dir_all(dir).map_err(|e| ScheduleError::io(dir, e))?;
    let dot_path = dir.join(format!("{}.dot", graph.body));
    fs::write(&dot_path, to_dot(graph, schedule)).map_err(|e| ScheduleError::io(&dot_path, e))?;
    let mrt_path = dir.join(format!("{}.mrt.txt", graph.body));
    fs::write(&mrt_path, reservation_table(graph, schedule, inventory))
        .map_err(|e| ScheduleError::io(&mrt_path, e))?;
    Ok(vec![dot_path, mrt_path])
}
