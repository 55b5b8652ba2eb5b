//! Resource annotation: operation kind → latency and per-issue usage.

use crate::config::{HardwareConfig, OpClass, ResourceVector};
use crate::ir::{AddressSpace, OpKind};

/// Cost of one node as seen by the schedulers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub latency: u32,
    pub usage: ResourceVector,
    /// Structural node: zero cost, kept only for ordering.
    pub ignore: bool,
}

impl Annotation {
    pub const STRUCTURAL: Annotation = Annotation {
        latency: 0,
        usage: ResourceVector::ZERO,
        ignore: true,
    };
}

/// Resource-table row of an operation; `None` for structural and
/// root-only kinds.
pub fn op_class(op: &OpKind) -> Option<OpClass> {
    match op {
        OpKind::Read { space, .. } => Some(match space {
            AddressSpace::Global => OpClass::ReadGlobal,
            AddressSpace::Shared => OpClass::ReadShared,
        }),
        OpKind::Write { space, .. } => Some(match space {
            AddressSpace::Global => OpClass::WriteGlobal,
            AddressSpace::Shared => OpClass::WriteShared,
        }),
        OpKind::Mma { .. } => Some(OpClass::Mma),
        OpKind::Binary { .. } | OpKind::Unary { .. } | OpKind::Constant { .. } => {
            Some(OpClass::Valu)
        }
        OpKind::Shuffle { .. } => Some(OpClass::Shuffle),
        OpKind::Placeholder { .. }
        | OpKind::IterArg { .. }
        | OpKind::Output
        | OpKind::SchedulingBarrier { .. }
        | OpKind::Argument { .. }
        | OpKind::Allocate { .. }
        | OpKind::Iterate { .. }
        | OpKind::GetResult { .. } => None,
    }
}

/// Look up `op` in the hardware's resource table.
pub fn annotate(op: &OpKind, hardware: &HardwareConfig) -> Annotation {
    let Some(class) = op_class(op) else {
        return Annotation::STRUCTURAL;
    };
    let cost = hardware.cost(class);
    let latency = match op {
        OpKind::Mma { shape } => cost.latency * shape.latency_scale(),
        _ => cost.latency,
    };
    Annotation {
        latency,
        usage: cost.usage,
        ignore: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceKind;
    use crate::ir::{BinaryOp, MmaShape};

    #[test]
    fn test_annotate_by_kind() {
        let hw = HardwareConfig::cdna3();
        let read = OpKind::Read {
            space: AddressSpace::Global,
            index: vec![],
            elements_per_thread: 8,
        };
        let a = annotate(&read, &hw);
        assert_eq!(a.latency, 4);
        assert_eq!(a.usage.get(ResourceKind::GlobalMemory), 1);
        assert!(!a.ignore);

        let add = annotate(&OpKind::Binary { op: BinaryOp::Add }, &hw);
        assert_eq!(add.usage, ResourceVector::single(ResourceKind::Valu, 1));

        assert_eq!(annotate(&OpKind::Output, &hw), Annotation::STRUCTURAL);
        assert_eq!(annotate(&OpKind::IterArg { index: 0 }, &hw), Annotation::STRUCTURAL);
    }

    #[test]
    fn test_mma_latency_scales_with_shape() {
        let hw = HardwareConfig::cdna3();
        let small = annotate(&OpKind::Mma { shape: MmaShape::F32_16x16x16_F16 }, &hw);
        let large = annotate(&OpKind::Mma { shape: MmaShape::F32_32x32x8_F16 }, &hw);
        assert_eq!(large.latency, 2 * small.latency);
        assert_eq!(small.usage, large.usage);
    }
}
