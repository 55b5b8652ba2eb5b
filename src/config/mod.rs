//! Scheduler configuration.
//!
//! Everything the scheduler can be told lives in one `SchedulerConfig`
//! value passed to `schedule_graph`; there is no process-wide state.

pub mod hardware;

use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use hardware::{HardwareConfig, OpClass, OpCost, ResourceKind, ResourceVector};

/// Which scheduler (if any) runs on each loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulingType {
    None,
    Prefetch,
    Modulo,
    ModuloMultiBuffered,
}

impl SchedulingType {
    /// Modulo variants run the II search; prefetch is heuristic.
    pub fn is_solver_based(self) -> bool {
        matches!(
            self,
            SchedulingType::Modulo | SchedulingType::ModuloMultiBuffered
        )
    }

    pub fn is_multi_buffered(self) -> bool {
        self == SchedulingType::ModuloMultiBuffered
    }

    pub fn name(self) -> &'static str {
        match self {
            SchedulingType::None => "none",
            SchedulingType::Prefetch => "prefetch",
            SchedulingType::Modulo => "modulo",
            SchedulingType::ModuloMultiBuffered => "modulo-multi-buffered",
        }
    }
}

impl FromStr for SchedulingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(SchedulingType::None),
            "prefetch" => Ok(SchedulingType::Prefetch),
            "modulo" => Ok(SchedulingType::Modulo),
            "modulo-multi-buffered" | "multi-buffered" => Ok(SchedulingType::ModuloMultiBuffered),
            other => Err(format!(
                "unknown scheduling mode '{}' (expected none, prefetch, modulo, or modulo-multi-buffered)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub mode: SchedulingType,
    pub hardware: HardwareConfig,
    /// Upper bound of the modulo scheduler's II search.
    pub max_initiation_interval: u32,
    /// Placement attempts per node the modulo scheduler may spend per II.
    pub budget_ratio: u32,
    /// Emit a scheduling barrier after each cycle group of a pipelined loop.
    pub use_scheduling_barriers: bool,
    /// Replay this schedule artifact instead of computing one.
    pub override_schedule: Option<PathBuf>,
    /// Write the computed schedule artifact here.
    pub dump_schedule: Option<PathBuf>,
    /// Write DOT and reservation-table dumps into this directory.
    pub visualize_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingType::None,
            hardware: HardwareConfig::cdna3(),
            max_initiation_interval: 64,
            budget_ratio: 8,
            use_scheduling_barriers: false,
            override_schedule: None,
            dump_schedule: None,
            visualize_dir: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_mode(mode: SchedulingType) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_hardware(mut self, hardware: HardwareConfig) -> Self {
        self.hardware = hardware;
        self
    }
}

/// Expand the `{loop}` placeholder of an artifact path.
pub fn loop_path(template: &Path, loop_name: &str) -> PathBuf {
    let text = template.to_string_lossy();
    if text.contains("{loop}") {
        PathBuf::from(text.replace("{loop}", loop_name))
    } else {
        template.to_path_buf()
    }
}
