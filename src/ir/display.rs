//! Textual dump of traces.
//!
//! ```text
//!   %5 = "mma_0" mma {F32_16x16x16_F16} (%3, %4, %1) @ abs 6 cyc 0 st 3 ii 2
//! ```

use std::fmt;

use super::*;

fn join_index(index: &[IndexExpr]) -> String {
    index
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn space_name(space: AddressSpace) -> &'static str {
    match space {
        AddressSpace::Global => "global",
        AddressSpace::Shared => "shared",
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Argument { name, space } => {
                write!(f, "argument {} {{{}}}", name, space_name(*space))
            }
            OpKind::Allocate { shape, space } => {
                write!(f, "allocate [{}] {{{}}}", join_index(shape), space_name(*space))
            }
            OpKind::Constant { value } => write!(f, "constant {}", value),
            OpKind::Placeholder { capture } => write!(f, "placeholder {}", capture),
            OpKind::IterArg { index } => write!(f, "iter_arg {}", index),
            OpKind::Output => write!(f, "output"),
            OpKind::Read {
                space,
                index,
                elements_per_thread,
            } => write!(
                f,
                "read {}[{}] x{}",
                space_name(*space),
                join_index(index),
                elements_per_thread
            ),
            OpKind::Write {
                space,
                index,
                elements_per_thread,
            } => write!(
                f,
                "write {}[{}] x{}",
                space_name(*space),
                join_index(index),
                elements_per_thread
            ),
            OpKind::Mma { shape } => write!(f, "mma {{{:?}}}", shape),
            OpKind::Binary { op } => write!(f, "{:?}", op),
            OpKind::Unary { op } => write!(f, "{:?}", op),
            OpKind::Shuffle { offset, width } => write!(f, "shuffle +{} w{}", offset, width),
            OpKind::Iterate {
                axis,
                subgraph,
                count,
                num_iter_args,
                ..
            } => {
                write!(f, "iterate {} -> {} carries {}", axis, subgraph, num_iter_args)?;
                if let Some(count) = count {
                    write!(f, " count {}", count)?;
                }
                Ok(())
            }
            OpKind::GetResult { index } => write!(f, "get_result {}", index),
            OpKind::SchedulingBarrier { cycle } => write!(f, "scheduling_barrier {}", cycle),
        }
    }
}

impl fmt::Display for SchedulingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "abs {} cyc {} st {} ii {}",
            self.absolute_cycle, self.cycle, self.stage, self.initiation_interval
        )
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, node) in self.iter() {
            let args: Vec<String> = node.args.iter().map(|a| a.to_string()).collect();
            write!(f, "  {} = \"{}\" {}", id, node.name, node.op)?;
            if !args.is_empty() {
                write!(f, " ({})", args.join(", "))?;
            }
            if let Some(s) = &node.schedule {
                write!(f, " @ {}", s)?;
            }
            if let Some(o) = &node.origin {
                write!(f, " <- {}:{} st {} it {}", o.body, o.node, o.stage, o.iteration)?;
            }
            writeln!(f)?;
        }
        for edge in &self.carried {
            writeln!(f, "  carried {} -> {} d{}", edge.from, edge.to, edge.distance)?;
        }
        Ok(())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel {}:", self.name)?;
        write!(f, "{}", self.root)?;
        for (name, graph) in &self.subgraphs {
            writeln!(f, "{}:", name)?;
            write!(f, "{}", graph)?;
        }
        Ok(())
    }
}
