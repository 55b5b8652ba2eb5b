use std::fmt;
use std::path::Path;

use crate::error::ScheduleError;

// ─── Resources ─────────────────────────────────────────────────────

/// Number of resource kinds.
pub const NUM_RESOURCES: usize = 5;

/// Hardware issue resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    GlobalMemory = 0,
    SharedMemory = 1,
    Mma = 2,
    Valu = 3,
    Shuffle = 4,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; NUM_RESOURCES] = [
        ResourceKind::GlobalMemory,
        ResourceKind::SharedMemory,
        ResourceKind::Mma,
        ResourceKind::Valu,
        ResourceKind::Shuffle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::GlobalMemory => "global_memory",
            ResourceKind::SharedMemory => "shared_memory",
            ResourceKind::Mma => "mma",
            ResourceKind::Valu => "valu",
            ResourceKind::Shuffle => "shuffle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }

    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|r| r.name().to_string()).collect()
    }
}

/// Units per resource kind, indexed by `ResourceKind as usize`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceVector(pub [u32; NUM_RESOURCES]);

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector([0; NUM_RESOURCES]);

    pub fn single(kind: ResourceKind, units: u32) -> Self {
        let mut v = Self::ZERO;
        v.0[kind as usize] = units;
        v
    }

    pub fn get(&self, kind: ResourceKind) -> u32 {
        self.0[kind as usize]
    }

    pub fn set(&mut self, kind: ResourceKind, units: u32) {
        self.0[kind as usize] = units;
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&u| u == 0)
    }

    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for i in 0..NUM_RESOURCES {
            out.0[i] += other.0[i];
        }
        out
    }

    pub fn sub(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for i in 0..NUM_RESOURCES {
            out.0[i] = out.0[i].saturating_sub(other.0[i]);
        }
        out
    }

    /// Component-wise `self <= capacity`.
    pub fn fits(&self, capacity: &ResourceVector) -> bool {
        self.0.iter().zip(capacity.0.iter()).all(|(u, c)| u <= c)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|u| u.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

// ─── Operation classes ─────────────────────────────────────────────

/// Resource-table row an operation is charged against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpClass {
    ReadGlobal = 0,
    WriteGlobal = 1,
    ReadShared = 2,
    WriteShared = 3,
    Mma = 4,
    Valu = 5,
    Shuffle = 6,
}

pub const NUM_OP_CLASSES: usize = 7;

impl OpClass {
    pub const ALL: [OpClass; NUM_OP_CLASSES] = [
        OpClass::ReadGlobal,
        OpClass::WriteGlobal,
        OpClass::ReadShared,
        OpClass::WriteShared,
        OpClass::Mma,
        OpClass::Valu,
        OpClass::Shuffle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpClass::ReadGlobal => "read_global",
            OpClass::WriteGlobal => "write_global",
            OpClass::ReadShared => "read_shared",
            OpClass::WriteShared => "write_shared",
            OpClass::Mma => "mma",
            OpClass::Valu => "valu",
            OpClass::Shuffle => "shuffle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Latency and per-issue resource usage of one operation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpCost {
    pub latency: u32,
    pub usage: ResourceVector,
}

impl OpCost {
    pub fn new(latency: u32, kind: ResourceKind, units: u32) -> Self {
        Self {
            latency,
            usage: ResourceVector::single(kind, units),
        }
    }
}

// ─── Hardware configuration ────────────────────────────────────────

/// Resource inventory and resource table of a GPU target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareConfig {
    /// Short identifier used on the command line (e.g. "cdna3").
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Units of each resource available per cycle.
    pub inventory: ResourceVector,
    /// Indexed by `OpClass as usize`.
    pub ops: [OpCost; NUM_OP_CLASSES],
}

impl HardwareConfig {
    /// Built-in defaults for a CDNA3-class GPU.
    pub fn cdna3() -> Self {
        Self {
            name: "cdna3".to_string(),
            display_name: "AMD CDNA3".to_string(),
            inventory: ResourceVector([2, 2, 1, 2, 1]),
            ops: [
                OpCost::new(4, ResourceKind::GlobalMemory, 1),
                OpCost::new(4, ResourceKind::GlobalMemory, 1),
                OpCost::new(2, ResourceKind::SharedMemory, 1),
                OpCost::new(2, ResourceKind::SharedMemory, 1),
                OpCost::new(4, ResourceKind::Mma, 1),
                OpCost::new(1, ResourceKind::Valu, 1),
                OpCost::new(1, ResourceKind::Shuffle, 1),
            ],
        }
    }

    pub fn cost(&self, class: OpClass) -> &OpCost {
        &self.ops[class as usize]
    }

    pub fn capacity(&self, kind: ResourceKind) -> u32 {
        self.inventory.get(kind)
    }

    /// Every resource has capacity, every op has latency, and every op
    /// fits the inventory in a single cycle.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        for kind in ResourceKind::ALL {
            if self.capacity(kind) == 0 {
                return Err(ScheduleError::Config(format!(
                    "{}: resources.{} must be > 0",
                    self.name,
                    kind.name()
                )));
            }
        }
        for class in OpClass::ALL {
            let cost = self.cost(class);
            if cost.latency == 0 {
                return Err(ScheduleError::Config(format!(
                    "{}: op.{}.latency must be > 0",
                    self.name,
                    class.name()
                )));
            }
            if !cost.usage.fits(&self.inventory) {
                return Err(ScheduleError::Config(format!(
                    "{}: op.{} uses {} but only {} is available per cycle",
                    self.name,
                    class.name(),
                    cost.usage,
                    self.inventory
                )));
            }
        }
        Ok(())
    }

    /// Load a hardware description from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ScheduleError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ScheduleError::io(path, e))?;
        Self::parse_toml(&content, path)
    }

    /// Resolve a target by name: built-in targets first, then
    /// `targets/{name}.toml` relative to the working directory.
    pub fn resolve(name: &str) -> Result<Self, ScheduleError> {
        if name.contains('/') || name.contains('\\') || name.contains("..") || name.starts_with('.')
        {
            return Err(ScheduleError::Config(format!(
                "invalid target name '{}'",
                name
            )));
        }
        if name == "cdna3" {
            return Ok(Self::cdna3());
        }
        let path = std::path::PathBuf::from(format!("targets/{}.toml", name));
        if path.exists() {
            return Self::load(&path);
        }
        Err(ScheduleError::Config(format!(
            "unknown target '{}' (looked for '{}')",
            name,
            path.display()
        )))
    }

    /// Parse the target file. Sections not present keep the CDNA3 defaults;
    /// an `[op.<class>]` section that names any resource replaces that
    /// class's whole usage vector.
    fn parse_toml(content: &str, path: &Path) -> Result<Self, ScheduleError> {
        let err = |msg: String| ScheduleError::Config(format!("{}: {}", path.display(), msg));

        let mut config = Self::cdna3();
        config.name = String::new();
        let mut usage_seen = [false; NUM_OP_CLASSES];
        let mut section = String::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(err(format!("expected 'key = value', found '{}'", trimmed)));
            };
            let key = key.trim();
            let value = value.trim();
            let unquoted = value.trim_matches('"');
            let number = |what: &str| -> Result<u32, ScheduleError> {
                value
                    .parse()
                    .map_err(|_| err(format!("invalid {}: {}", what, value)))
            };

            match (section.as_str(), key) {
                ("target", "name") => config.name = unquoted.to_string(),
                ("target", "display_name") => config.display_name = unquoted.to_string(),
                ("resources", resource) => {
                    let kind = ResourceKind::from_name(resource)
                        .ok_or_else(|| err(format!("unknown resource '{}'", resource)))?;
                    let units = number(&format!("resources.{}", resource))?;
                    config.inventory.set(kind, units);
                }
                (op, field) if op.starts_with("op.") => {
                    let class_name = op.strip_prefix("op.").unwrap_or(op);
                    let class = OpClass::from_name(class_name)
                        .ok_or_else(|| err(format!("unknown op class '{}'", class_name)))?;
                    let what = format!("{}.{}", op, field);
                    let cost = &mut config.ops[class as usize];
                    if field == "latency" {
                        cost.latency = number(&what)?;
                    } else {
                        let kind = ResourceKind::from_name(field)
                            .ok_or_else(|| err(format!("unknown resource '{}' in [{}]", field, op)))?;
                        if !usage_seen[class as usize] {
                            cost.usage = ResourceVector::ZERO;
                            usage_seen[class as usize] = true;
                        }
                        cost.usage.set(kind, number(&what)?);
                    }
                }
                _ => {
                    return Err(err(format!("unknown key '{}' in [{}]", key, section)));
                }
            }
        }

        if config.name.is_empty() {
            return Err(err("missing target.name".to_string()));
        }
        config.validate()?;
        Ok(config)
    }
}
