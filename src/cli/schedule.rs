use std::path::PathBuf;
use std::process;

use clap::Args;
use tilesched::diagnostic::render_diagnostics;
use tilesched::{schedule_graph, HardwareConfig, LoopDecision, SchedulerConfig, SchedulingType};

use super::{load_kernel, write_kernel};

#[derive(Args)]
pub struct ScheduleArgs {
    /// Kernel JSON file ({"trace": ..., "constraints": ...})
    pub input: Option<PathBuf>,
    /// Use a built-in kernel instead of a file
    #[arg(long, value_name = "NAME")]
    pub builtin: Option<String>,
    /// Scheduling mode: none, prefetch, modulo, modulo-multi-buffered
    #[arg(long, default_value = "modulo")]
    pub mode: SchedulingType,
    /// Hardware target (built-in name or targets/<name>.toml)
    #[arg(long, default_value = "cdna3")]
    pub target: String,
    /// Upper bound of the modulo scheduler's II search
    #[arg(long, default_value_t = 64)]
    pub max_ii: u32,
    /// Emit a scheduling barrier after each cycle group
    #[arg(long)]
    pub barriers: bool,
    /// Write each loop's schedule artifact here ({loop} = loop body name)
    #[arg(long, value_name = "PATH")]
    pub dump: Option<PathBuf>,
    /// Replay schedule artifacts instead of scheduling ({loop} = loop body name)
    #[arg(long = "override", value_name = "PATH")]
    pub override_schedule: Option<PathBuf>,
    /// Write DOT graphs and reservation tables into this directory
    #[arg(long, value_name = "DIR")]
    pub visualize: Option<PathBuf>,
    /// Set a hyperparameter (repeatable)
    #[arg(long = "set", value_name = "SYM=VAL", value_parser = parse_binding)]
    pub bindings: Vec<(String, i64)>,
    /// Write the rewritten kernel here instead of printing it
    #[arg(long, value_name = "PATH")]
    pub emit: Option<PathBuf>,
}

fn parse_binding(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SYM=VAL, found '{}'", s))?;
    let value = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not an integer", value.trim()))?;
    Ok((name.trim().to_string(), value))
}

pub fn cmd_schedule(args: ScheduleArgs) {
    let mut loaded = load_kernel(args.input.as_deref(), args.builtin.as_deref());
    for (name, value) in args.bindings {
        loaded.kernel.constraints.hyperparams.insert(name, value);
    }

    let hardware = match HardwareConfig::resolve(&args.target) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    let config = SchedulerConfig {
        mode: args.mode,
        hardware,
        max_initiation_interval: args.max_ii,
        use_scheduling_barriers: args.barriers,
        override_schedule: args.override_schedule,
        dump_schedule: args.dump,
        visualize_dir: args.visualize,
        ..SchedulerConfig::default()
    };

    let kernel = &mut loaded.kernel;
    let report = match schedule_graph(&mut kernel.trace, &kernel.constraints, &config) {
        Ok(r) => r,
        Err(e) => {
            render_diagnostics(&[e.to_diagnostic()], &loaded.filename, &loaded.source);
            process::exit(1);
        }
    };
    let warnings: Vec<_> = report.diagnostics().cloned().collect();
    render_diagnostics(&warnings, &loaded.filename, &loaded.source);

    for l in &report.loops {
        let ii = l.initiation_interval.map_or("-".to_string(), |ii| ii.to_string());
        let stages = l.num_stages.map_or("-".to_string(), |s| s.to_string());
        let outcome = match &l.decision {
            LoopDecision::Pipelined { kernel_trip_count } => {
                format!("pipelined, kernel runs {} times", kernel_trip_count)
            }
            LoopDecision::Skipped(reason) => format!("not pipelined ({})", reason),
        };
        eprintln!(
            "{}: II {} stages {} [{}] {}",
            l.loop_name,
            ii,
            stages,
            l.mode.name(),
            outcome
        );
        for hazard in &l.hazards {
            eprintln!(
                "  buffer {}: stages {}..{} -> {} copies",
                hazard.buffer, hazard.write_stage, hazard.read_stage, hazard.buffers
            );
        }
    }

    match &args.emit {
        Some(path) => {
            write_kernel(path, &loaded.kernel);
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", loaded.kernel.trace),
    }
}
