//! Programmatic construction of traced kernels.
//!
//! Stands in for the tracing frontend in tests, benches and the CLI's
//! built-in kernels.

use super::*;

pub struct KernelBuilder {
    trace: Trace,
}

impl KernelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            trace: Trace::new(name),
        }
    }

    pub fn node(&mut self, name: &str, op: OpKind, args: Vec<NodeId>) -> NodeId {
        self.trace.root.add(Node::new(name, op, args))
    }

    pub fn argument(&mut self, name: &str, space: AddressSpace) -> NodeId {
        self.node(
            name,
            OpKind::Argument {
                name: name.to_string(),
                space,
            },
            Vec::new(),
        )
    }

    /// Shared-memory buffer.
    pub fn allocate(&mut self, name: &str, shape: Vec<IndexExpr>) -> NodeId {
        self.node(
            name,
            OpKind::Allocate {
                shape,
                space: AddressSpace::Shared,
            },
            Vec::new(),
        )
    }

    pub fn constant(&mut self, name: &str, value: i64) -> NodeId {
        self.node(name, OpKind::Constant { value }, Vec::new())
    }

    /// Add a loop over `axis`. `body` receives a builder whose placeholders
    /// mirror `captures` and whose iter args mirror `init_args`, and returns
    /// the values carried into the next iteration.
    pub fn iterate(
        &mut self,
        name: &str,
        axis: &str,
        init_args: &[NodeId],
        captures: &[NodeId],
        body: impl FnOnce(&mut BodyBuilder) -> Vec<NodeId>,
    ) -> NodeId {
        let subgraph = format!("{}_body", name);
        let induction_var = format!("${}", axis);
        let mut bb = BodyBuilder::new(&induction_var, init_args.len(), captures.len());
        let results = body(&mut bb);
        let mut graph = bb.graph;
        graph.add(Node::new("output", OpKind::Output, results));
        graph.close_loop();
        self.trace.subgraphs.insert(subgraph.clone(), graph);

        let mut args = init_args.to_vec();
        args.extend_from_slice(captures);
        self.node(
            name,
            OpKind::Iterate {
                axis: axis.to_string(),
                induction_var,
                subgraph,
                count: None,
                num_iter_args: init_args.len(),
            },
            args,
        )
    }

    /// Give a loop an explicit trip count instead of its axis' tiling.
    pub fn set_count(&mut self, iterate: NodeId, trip_count: IndexExpr) {
        if let Some(OpKind::Iterate { count, .. }) = self.trace.root.get_mut(iterate).map(|n| &mut n.op) {
            *count = Some(trip_count);
        }
    }

    pub fn get_result(&mut self, name: &str, iterate: NodeId, index: usize) -> NodeId {
        self.node(name, OpKind::GetResult { index }, vec![iterate])
    }

    pub fn finish(self) -> Trace {
        self.trace
    }
}

pub struct BodyBuilder {
    graph: Graph,
    induction_var: String,
    captures: Vec<NodeId>,
    iter_args: Vec<NodeId>,
}

impl BodyBuilder {
    fn new(induction_var: &str, num_iter_args: usize, num_captures: usize) -> Self {
        let mut graph = Graph::new();
        let captures = (0..num_captures)
            .map(|capture| {
                graph.add(Node::new(
                    format!("capture_{}", capture),
                    OpKind::Placeholder { capture },
                    Vec::new(),
                ))
            })
            .collect();
        let iter_args = (0..num_iter_args)
            .map(|index| {
                graph.add(Node::new(
                    format!("iter_arg_{}", index),
                    OpKind::IterArg { index },
                    Vec::new(),
                ))
            })
            .collect();
        Self {
            graph,
            induction_var: induction_var.to_string(),
            captures,
            iter_args,
        }
    }

    /// The loop's induction variable as an index expression.
    pub fn induction(&self) -> IndexExpr {
        IndexExpr::sym(self.induction_var.clone())
    }

    /// Placeholder for the i-th captured outer value.
    pub fn capture(&self, i: usize) -> NodeId {
        self.captures[i]
    }

    /// IterArg for the i-th carried value.
    pub fn iter_arg(&self, i: usize) -> NodeId {
        self.iter_args[i]
    }

    pub fn node(&mut self, name: &str, op: OpKind, args: Vec<NodeId>) -> NodeId {
        self.graph.add(Node::new(name, op, args))
    }

    pub fn read(
        &mut self,
        name: &str,
        memory: NodeId,
        space: AddressSpace,
        index: Vec<IndexExpr>,
    ) -> NodeId {
        self.node(
            name,
            OpKind::Read {
                space,
                index,
                elements_per_thread: 8,
            },
            vec![memory],
        )
    }

    pub fn write(
        &mut self,
        name: &str,
        value: NodeId,
        memory: NodeId,
        space: AddressSpace,
        index: Vec<IndexExpr>,
    ) -> NodeId {
        self.node(
            name,
            OpKind::Write {
                space,
                index,
                elements_per_thread: 8,
            },
            vec![value, memory],
        )
    }

    pub fn mma(
        &mut self,
        name: &str,
        lhs: NodeId,
        rhs: NodeId,
        acc: NodeId,
        shape: MmaShape,
    ) -> NodeId {
        self.node(name, OpKind::Mma { shape }, vec![lhs, rhs, acc])
    }

    pub fn binary(&mut self, name: &str, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.node(name, OpKind::Binary { op }, vec![lhs, rhs])
    }

    pub fn unary(&mut self, name: &str, op: UnaryOp, value: NodeId) -> NodeId {
        self.node(name, OpKind::Unary { op }, vec![value])
    }

    pub fn shuffle(&mut self, name: &str, value: NodeId, offset: u32, width: u32) -> NodeId {
        self.node(name, OpKind::Shuffle { offset, width }, vec![value])
    }
}
