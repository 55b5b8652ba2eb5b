//! Software pipelining of a scheduled loop.
//!
//! A loop of `N` iterations scheduled into `S` stages is executed as
//! `N + S - 1` virtual trips; trip `τ` runs stage `k` of iteration `τ - k`.
//!
//! ```text
//! trip:      0      1     ..  S-2  | S-1 .. N-1 |  N    ..  N+S-2
//!            └────── prologue ─────┘└─ kernel ──┘└──── epilogue ────┘
//! stages:    ≤0     ≤1        ≤S-2     all          ≥1        ≥S-1
//! ```
//!
//! The prologue and epilogue are emitted straight into the root graph with
//! constant or `N`-relative iteration indices. The kernel becomes a new
//! `Iterate` of `N - (S - 1)` trips whose carried values are rotating
//! slots: slot `(p, a)` holds the value `p` produced `a` trips ago. Inside
//! one trip, operations issue in `(phase, absolute cycle, program order)`
//! order, which the schedule guarantees places every same-trip producer
//! before its consumers.

pub mod multibuffer;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::ScheduleError;
use crate::ir::{Graph, IndexExpr, Node, NodeId, OpKind, Origin, SchedulingParams, Trace};

/// Handles into the rewritten root graph.
#[derive(Clone, Debug)]
pub struct PipelinedLoop {
    /// The steady-state `Iterate`.
    pub kernel: NodeId,
    /// Subgraph holding the steady-state body.
    pub kernel_body: String,
    pub kernel_trip_count: IndexExpr,
    pub prologue: Vec<NodeId>,
    pub epilogue: Vec<NodeId>,
}

/// Rewrite the scheduled loop `loop_id` of `trace` into prologue, kernel and
/// epilogue. The body must carry scheduling metadata and the trip count
/// must exceed `num_stages - 1`; both are the caller's to establish.
pub fn build_pipelined_loop(
    trace: &mut Trace,
    loop_id: NodeId,
    trip_count: &IndexExpr,
    num_stages: u32,
    use_scheduling_barriers: bool,
) -> Result<PipelinedLoop, ScheduleError> {
    let shape = LoopShape::of(trace, loop_id)?;
    let body = trace
        .subgraph(&shape.body_name)
        .cloned()
        .ok_or_else(|| malformed(format!("missing loop body '{}'", shape.body_name)))?;
    if num_stages < 2 {
        return Err(malformed(format!(
            "loop '{}' has a single stage and cannot be pipelined",
            shape.name
        )));
    }
    let pipeliner = Pipeliner::new(&shape, &body, num_stages)?;
    pipeliner.rewrite(trace, loop_id, trip_count, use_scheduling_barriers)
}

fn malformed(message: String) -> ScheduleError {
    ScheduleError::MalformedGraph(message)
}

/// The parts of an `Iterate` the rewrite needs, detached from the trace.
struct LoopShape {
    name: String,
    axis: String,
    induction_var: String,
    body_name: String,
    num_iter_args: usize,
    args: Vec<NodeId>,
}

impl LoopShape {
    fn of(trace: &Trace, loop_id: NodeId) -> Result<Self, ScheduleError> {
        let node = trace
            .root
            .get(loop_id)
            .ok_or_else(|| malformed(format!("loop {} is not in the root graph", loop_id)))?;
        let OpKind::Iterate {
            axis,
            induction_var,
            subgraph,
            num_iter_args,
            ..
        } = &node.op
        else {
            return Err(malformed(format!("'{}' is not a loop", node.name)));
        };
        Ok(Self {
            name: node.name.clone(),
            axis: axis.clone(),
            induction_var: induction_var.clone(),
            body_name: subgraph.clone(),
            num_iter_args: *num_iter_args,
            args: node.args.clone(),
        })
    }

    fn init(&self, index: usize) -> Result<NodeId, ScheduleError> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| malformed(format!("loop '{}' has no init value {}", self.name, index)))
    }

    fn capture(&self, capture: usize) -> Result<NodeId, ScheduleError> {
        self.args
            .get(self.num_iter_args + capture)
            .copied()
            .ok_or_else(|| malformed(format!("loop '{}' has no capture {}", self.name, capture)))
    }

    fn captures(&self) -> &[NodeId] {
        self.args.get(self.num_iter_args..).unwrap_or(&[])
    }
}

/// Where an operand of a body operation comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    /// Outer value captured by the loop.
    Capture(usize),
    /// A carried value no iteration changes.
    Init(usize),
    /// `producer` of `delta` iterations earlier. Iteration -1 stands for the
    /// initial value of carried slot `via`.
    Producer {
        producer: NodeId,
        via: Option<usize>,
        delta: u32,
    },
}

/// `(producer, via, age)`: the value `producer` had `age` trips ago.
type Slot = (NodeId, Option<usize>, u32);

struct StagedOp {
    id: NodeId,
    params: SchedulingParams,
}

impl StagedOp {
    fn stage(&self) -> u32 {
        self.params.stage
    }
}

struct Pipeliner<'a> {
    shape: &'a LoopShape,
    body: &'a Graph,
    /// Every operation of the body, in issue order.
    ops: Vec<StagedOp>,
    output: Vec<NodeId>,
    num_stages: u32,
}

impl<'a> Pipeliner<'a> {
    fn new(shape: &'a LoopShape, body: &'a Graph, num_stages: u32) -> Result<Self, ScheduleError> {
        let output = body
            .output()
            .map(|o| body[o].args.clone())
            .ok_or_else(|| malformed(format!("{}: loop body has no output", shape.body_name)))?;

        let mut ops = Vec::new();
        for (order, (id, node)) in body.iter().enumerate() {
            if node.op.is_structural() {
                continue;
            }
            let params = node.schedule.ok_or_else(|| {
                malformed(format!(
                    "{}: '{}' has no schedule",
                    shape.body_name, node.name
                ))
            })?;
            if params.stage >= num_stages {
                return Err(malformed(format!(
                    "{}: '{}' is in stage {} of a {}-stage schedule",
                    shape.body_name, node.name, params.stage, num_stages
                )));
            }
            ops.push((params.cycle, params.absolute_cycle, order, StagedOp { id, params }));
        }
        ops.sort_by_key(|&(phase, absolute, order, _)| (phase, absolute, order));

        Ok(Self {
            shape,
            body,
            ops: ops.into_iter().map(|(_, _, _, op)| op).collect(),
            output,
            num_stages,
        })
    }

    fn source(&self, operand: NodeId) -> Result<Source, ScheduleError> {
        let node = self.body.get(operand).ok_or_else(|| {
            malformed(format!(
                "{}: operand {} is not in the body",
                self.shape.body_name, operand
            ))
        })?;
        Ok(match node.op {
            OpKind::Placeholder { capture } => Source::Capture(capture),
            OpKind::IterArg { index } => {
                let result = self.output.get(index).copied().ok_or_else(|| {
                    malformed(format!(
                        "{}: no output for iter arg {}",
                        self.shape.body_name, index
                    ))
                })?;
                match self.body.get(result).map(|n| &n.op) {
                    Some(OpKind::IterArg { index: j }) if *j == index => Source::Init(index),
                    Some(OpKind::IterArg { .. }) => {
                        return Err(malformed(format!(
                            "{}: output {} forwards another iter arg",
                            self.shape.body_name, index
                        )))
                    }
                    _ => Source::Producer {
                        producer: result,
                        via: Some(index),
                        delta: 1,
                    },
                }
            }
            _ => Source::Producer {
                producer: operand,
                via: None,
                delta: 0,
            },
        })
    }

    /// Root value of a producer that is a captured placeholder.
    fn captured(&self, producer: NodeId) -> Result<Option<NodeId>, ScheduleError> {
        match self.body.get(producer).map(|n| &n.op) {
            Some(OpKind::Placeholder { capture }) => self.shape.capture(*capture).map(Some),
            _ => Ok(None),
        }
    }

    fn stage_of(&self, producer: NodeId) -> u32 {
        self.body
            .get(producer)
            .and_then(|n| n.schedule)
            .map_or(0, |s| s.stage)
    }

    /// Trips between the producer's issue and the consumer's.
    fn age(&self, consumer: &StagedOp, producer: NodeId, delta: u32) -> Result<u32, ScheduleError> {
        (consumer.stage() + delta)
            .checked_sub(self.stage_of(producer))
            .ok_or_else(|| {
                malformed(format!(
                    "{}: '{}' is scheduled before its operand '{}'",
                    self.shape.body_name,
                    self.body[consumer.id].name,
                    self.body[producer].name
                ))
            })
    }

    fn slots(&self) -> Result<BTreeSet<Slot>, ScheduleError> {
        let mut slots = BTreeSet::new();
        for op in &self.ops {
            for &arg in &self.body[op.id].args {
                if let Source::Producer {
                    producer,
                    via,
                    delta,
                } = self.source(arg)?
                {
                    let age = self.age(op, producer, delta)?;
                    slots.extend((1..=age).map(|a| (producer, via, a)));
                }
            }
        }
        // Results of stage 0 leave through the kernel's last trip.
        for &result in &self.output {
            let is_op = self
                .body
                .get(result)
                .is_some_and(|n| !n.op.is_structural());
            if is_op && self.stage_of(result) == 0 {
                slots.insert((result, None, 1));
            }
        }
        Ok(slots)
    }

    fn instantiate(&self, op: &StagedOp, name: String, args: Vec<NodeId>, iteration: IndexExpr) -> Node {
        let src = &self.body[op.id];
        let mut node = Node::new(name, src.op.clone(), args);
        if let Some(index) = node.op.index_mut() {
            for expr in index.iter_mut() {
                *expr = expr.subs_sym(&self.shape.induction_var, &iteration);
            }
        }
        node.schedule = Some(op.params);
        node.origin = Some(Origin {
            body: self.shape.body_name.clone(),
            node: op.id,
            stage: op.stage(),
            iteration,
        });
        node
    }

    fn missing(&self, producer: NodeId, at: &str) -> ScheduleError {
        malformed(format!(
            "{}: no value of '{}' {}",
            self.shape.body_name, self.body[producer].name, at
        ))
    }

    fn rewrite(
        &self,
        trace: &mut Trace,
        loop_id: NodeId,
        trip_count: &IndexExpr,
        barriers: bool,
    ) -> Result<PipelinedLoop, ScheduleError> {
        let shape = self.shape;
        let s = self.num_stages;
        let fill = (s - 1) as i64;

        let get_results: Vec<(NodeId, usize)> = trace
            .root
            .users(loop_id)
            .into_iter()
            .map(|u| match trace.root[u].op {
                OpKind::GetResult { index } => Ok((u, index)),
                _ => Err(malformed(format!(
                    "'{}' uses loop '{}' directly",
                    trace.root[u].name, shape.name
                ))),
            })
            .collect::<Result<_, _>>()?;

        let slots: Vec<Slot> = self.slots()?.into_iter().collect();
        let slot_index: BTreeMap<Slot, usize> =
            slots.iter().enumerate().map(|(i, &slot)| (slot, i)).collect();
        let slot_of = |slot: Slot| {
            slot_index
                .get(&slot)
                .copied()
                .ok_or_else(|| self.missing(slot.0, &format!("{} trips back", slot.2)))
        };

        let root = &mut trace.root;

        // ─── Prologue ───
        let mut prologue: BTreeMap<(NodeId, i64), NodeId> = BTreeMap::new();
        let mut prologue_ids = Vec::new();
        for trip in 0..fill {
            for op in self.ops.iter().filter(|op| (op.stage() as i64) <= trip) {
                let iteration = trip - op.stage() as i64;
                let mut args = Vec::new();
                for &arg in &self.body[op.id].args {
                    let value = match self.source(arg)? {
                        Source::Capture(c) => shape.capture(c)?,
                        Source::Init(i) => shape.init(i)?,
                        Source::Producer {
                            producer,
                            via,
                            delta,
                        } => {
                            let at = iteration - delta as i64;
                            self.prologue_value(&prologue, producer, via, at)?
                        }
                    };
                    args.push(value);
                }
                let name = format!("{}.prologue.{}", self.body[op.id].name, trip);
                let node = self.instantiate(op, name, args, IndexExpr::Const(iteration));
                let id = root.insert_before(loop_id, node);
                prologue.insert((op.id, iteration), id);
                prologue_ids.push(id);
            }
        }

        // Slot (p, a) enters the kernel holding p from trip S-1-a.
        let mut inits = Vec::with_capacity(slots.len());
        for &(producer, via, age) in &slots {
            let at = fill - age as i64 - self.stage_of(producer) as i64;
            inits.push(self.prologue_value(&prologue, producer, via, at)?);
        }

        // ─── Kernel ───
        let mut outer: Vec<NodeId> = shape.captures().to_vec();
        for (i, &result) in self.output.iter().enumerate() {
            if self.source_of_result(result, i)? == Source::Init(i) {
                let init = shape.init(i)?;
                if !outer.contains(&init) {
                    outer.push(init);
                }
            }
        }
        let mut kernel = Graph::new();
        let placeholders: Vec<NodeId> = (0..outer.len())
            .map(|capture| {
                kernel.add(Node::new(
                    format!("capture_{}", capture),
                    OpKind::Placeholder { capture },
                    Vec::new(),
                ))
            })
            .collect();
        let inner = |value: NodeId| {
            outer
                .iter()
                .position(|&v| v == value)
                .map(|j| placeholders[j])
                .ok_or_else(|| malformed(format!("{} is not captured by the kernel", value)))
        };
        let slot_args: Vec<NodeId> = slots
            .iter()
            .enumerate()
            .map(|(index, &(producer, _, age))| {
                kernel.add(Node::new(
                    format!("{}.slot{}", self.body[producer].name, age),
                    OpKind::IterArg { index },
                    Vec::new(),
                ))
            })
            .collect();

        let induction = IndexExpr::sym(shape.induction_var.clone());
        let mut current: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut phase: Option<u32> = None;
        for op in &self.ops {
            if barriers {
                if let Some(prev) = phase.filter(|&p| p != op.params.cycle) {
                    kernel.add(barrier(prev));
                }
            }
            phase = Some(op.params.cycle);
            let mut args = Vec::new();
            for &arg in &self.body[op.id].args {
                let value = match self.source(arg)? {
                    Source::Capture(c) => placeholders[c],
                    Source::Init(i) => inner(shape.init(i)?)?,
                    Source::Producer {
                        producer,
                        via,
                        delta,
                    } => match self.age(op, producer, delta)? {
                        0 => current
                            .get(&producer)
                            .copied()
                            .ok_or_else(|| self.missing(producer, "earlier in the trip"))?,
                        age => slot_args[slot_of((producer, via, age))?],
                    },
                };
                args.push(value);
            }
            let iteration = induction.clone().offset(fill - op.stage() as i64);
            let node = self.instantiate(op, self.body[op.id].name.clone(), args, iteration);
            current.insert(op.id, kernel.add(node));
        }
        if let (true, Some(last)) = (barriers, phase) {
            kernel.add(barrier(last));
        }

        let mut next = Vec::with_capacity(slots.len());
        for &(producer, via, age) in &slots {
            let value = if age > 1 {
                slot_args[slot_of((producer, via, age - 1))?]
            } else if let Some(outer_value) = self.captured(producer)? {
                inner(outer_value)?
            } else {
                current
                    .get(&producer)
                    .copied()
                    .ok_or_else(|| self.missing(producer, "in the kernel"))?
            };
            next.push(value);
        }
        kernel.add(Node::new("output", OpKind::Output, next));
        kernel.close_loop();

        let kernel_body = format!("{}_kernel", shape.body_name);
        let kernel_trip_count = trip_count.clone().offset(-fill);
        let mut kernel_args = inits;
        kernel_args.extend_from_slice(&outer);
        let kernel_id = root.insert_before(
            loop_id,
            Node::new(
                format!("{}_kernel", shape.name),
                OpKind::Iterate {
                    axis: shape.axis.clone(),
                    induction_var: shape.induction_var.clone(),
                    subgraph: kernel_body.clone(),
                    count: Some(kernel_trip_count.clone()),
                    num_iter_args: slots.len(),
                },
                kernel_args,
            ),
        );

        // Kernel results are read lazily, right before their first use.
        let mut results: BTreeMap<usize, NodeId> = BTreeMap::new();
        let mut kernel_result = |root: &mut Graph, index: usize| {
            *results.entry(index).or_insert_with(|| {
                root.insert_before(
                    loop_id,
                    Node::new(
                        format!("{}_kernel.{}", shape.name, index),
                        OpKind::GetResult { index },
                        vec![kernel_id],
                    ),
                )
            })
        };

        // ─── Epilogue ───
        let mut epilogue: BTreeMap<(NodeId, u32), NodeId> = BTreeMap::new();
        let mut epilogue_ids = Vec::new();
        for step in 0..s - 1 {
            for op in self.ops.iter().filter(|op| op.stage() > step) {
                let mut args = Vec::new();
                for &arg in &self.body[op.id].args {
                    let value = match self.source(arg)? {
                        Source::Capture(c) => shape.capture(c)?,
                        Source::Init(i) => shape.init(i)?,
                        Source::Producer {
                            producer,
                            via,
                            delta,
                        } => {
                            let age = self.age(op, producer, delta)?;
                            if let Some(outer_value) = self.captured(producer)? {
                                outer_value
                            } else if step >= age {
                                epilogue
                                    .get(&(producer, step - age))
                                    .copied()
                                    .ok_or_else(|| self.missing(producer, "in the epilogue"))?
                            } else {
                                kernel_result(&mut *root, slot_of((producer, via, age - step))?)
                            }
                        }
                    };
                    args.push(value);
                }
                let name = format!("{}.epilogue.{}", self.body[op.id].name, step);
                let iteration = trip_count.clone().offset(step as i64 - op.stage() as i64);
                let node = self.instantiate(op, name, args, iteration);
                let id = root.insert_before(loop_id, node);
                epilogue.insert((op.id, step), id);
                epilogue_ids.push(id);
            }
        }

        // Values of the last iteration replace the loop's results.
        let mut finals = Vec::with_capacity(self.output.len());
        for (i, &result) in self.output.iter().enumerate() {
            let value = match self.source_of_result(result, i)? {
                Source::Init(i) => shape.init(i)?,
                Source::Capture(c) => shape.capture(c)?,
                Source::Producer { producer, .. } => match self.stage_of(producer) {
                    0 => kernel_result(&mut *root, slot_of((producer, None, 1))?),
                    k => epilogue
                        .get(&(producer, k - 1))
                        .copied()
                        .ok_or_else(|| self.missing(producer, "after the epilogue"))?,
                },
            };
            finals.push(value);
        }
        for (get_result, index) in get_results {
            let value = finals.get(index).copied().ok_or_else(|| {
                malformed(format!("loop '{}' has no result {}", shape.name, index))
            })?;
            root.replace_all_uses(get_result, value);
            root.erase(get_result);
        }
        root.erase(loop_id);

        trace.subgraphs.remove(&shape.body_name);
        trace.subgraphs.insert(kernel_body.clone(), kernel);
        debug!(
            loop_name = %shape.name,
            prologue = prologue_ids.len(),
            epilogue = epilogue_ids.len(),
            slots = slots.len(),
            "built pipelined loop"
        );

        Ok(PipelinedLoop {
            kernel: kernel_id,
            kernel_body,
            kernel_trip_count,
            prologue: prologue_ids,
            epilogue: epilogue_ids,
        })
    }

    /// How the loop's `index`-th result is defined by the body output.
    fn source_of_result(&self, result: NodeId, index: usize) -> Result<Source, ScheduleError> {
        match self.body.get(result).map(|n| &n.op) {
            Some(OpKind::Placeholder { capture }) => Ok(Source::Capture(*capture)),
            Some(OpKind::IterArg { index: j }) if *j == index => Ok(Source::Init(index)),
            Some(OpKind::IterArg { .. }) => Err(malformed(format!(
                "{}: output {} forwards another iter arg",
                self.shape.body_name, index
            ))),
            Some(_) => Ok(Source::Producer {
                producer: result,
                via: Some(index),
                delta: 0,
            }),
            None => Err(self.missing(result, "for the output")),
        }
    }

    /// Value of `producer` in iteration `at` of the prologue; iteration -1
    /// is the initial value of slot `via`.
    fn prologue_value(
        &self,
        prologue: &BTreeMap<(NodeId, i64), NodeId>,
        producer: NodeId,
        via: Option<usize>,
        at: i64,
    ) -> Result<NodeId, ScheduleError> {
        if at < 0 {
            return match via {
                Some(i) => self.shape.init(i),
                None => Err(self.missing(producer, &format!("at iteration {}", at))),
            };
        }
        if let Some(outer_value) = self.captured(producer)? {
            return Ok(outer_value);
        }
        prologue
            .get(&(producer, at))
            .copied()
            .ok_or_else(|| self.missing(producer, &format!("at iteration {}", at)))
    }
}

fn barrier(cycle: u32) -> Node {
    Node::new(
        format!("barrier.{}", cycle),
        OpKind::SchedulingBarrier { cycle },
        Vec::new(),
    )
}
