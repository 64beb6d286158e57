//! Command-line runner: parse flags, wire the export pipeline and optional
//! display sink, run the bounded simulation loop.

use anyhow::{Context, Result};
use clap::Parser;
use fishschool_core::{
    BoundaryPolicy, FrameSink, Position, School, SchoolConfig, SinkError,
};
use fishschool_storage::ExportPipeline;
use std::path::PathBuf;
use tracing::info;

/// Fish school simulation: a fixed population steered by attraction,
/// repulsion, and inertia inside a bounded 3D volume, with per-step JSON
/// snapshots written to the dumping location.
#[derive(Debug, Parser)]
#[command(name = "fishschool", version, about)]
struct Cli {
    /// Number of fish in the school.
    #[arg(long, default_value_t = 8)]
    num_fish: usize,
    /// Number of simulation steps.
    #[arg(long, default_value_t = 16)]
    num_step: u64,
    /// Domain extent along x.
    #[arg(long, default_value_t = 1.0)]
    space_dim_x: f64,
    /// Domain extent along y.
    #[arg(long, default_value_t = 1.0)]
    space_dim_y: f64,
    /// Domain extent along z.
    #[arg(long, default_value_t = 1.0)]
    space_dim_z: f64,
    /// Strength of the attraction rule.
    #[arg(long, default_value_t = 1.0)]
    attraction_strength: f64,
    /// Range of the attraction rule (also sizes the neighbor grid cells).
    #[arg(long, default_value_t = 0.2)]
    attraction_radius: f64,
    /// Strength of the repulsion rule.
    #[arg(long, default_value_t = 2.0)]
    repulsion_strength: f64,
    /// Range of the repulsion rule.
    #[arg(long, default_value_t = 0.02)]
    repulsion_radius: f64,
    /// Inertia along the antero-posterior axis.
    #[arg(long, default_value_t = 1.0)]
    inertia_strength_ap: f64,
    /// Inertia along the right-left axis.
    #[arg(long, default_value_t = 0.5)]
    inertia_strength_rl: f64,
    /// Inertia along the dorso-ventral axis.
    #[arg(long, default_value_t = 2.0)]
    inertia_strength_dv: f64,
    /// Random perturbation magnitude, antero-posterior.
    #[arg(long, default_value_t = 0.01)]
    random_step_ap: f64,
    /// Random perturbation magnitude, right-left.
    #[arg(long, default_value_t = 0.02)]
    random_step_rl: f64,
    /// Random perturbation magnitude, dorso-ventral.
    #[arg(long, default_value_t = 0.005)]
    random_step_dv: f64,
    /// Boundary handling: reflect, clamp, or wrap.
    #[arg(long, default_value_t = BoundaryPolicy::Reflect)]
    boundary_policy: BoundaryPolicy,
    /// Optional cap on heading magnitude after force summation.
    #[arg(long)]
    heading_cap: Option<f64>,
    /// RNG seed for a reproducible run; omitted means entropy-seeded.
    #[arg(long)]
    seed: Option<u64>,
    /// Directory receiving one step_NNNNNN.json snapshot per step.
    #[arg(long, default_value = ".")]
    dumping_location: PathBuf,
    /// Log a point-cloud summary of each frame.
    #[arg(long, default_value_t = false)]
    display: bool,
    /// Abort the run on the first snapshot export failure instead of
    /// logging it and continuing.
    #[arg(long, default_value_t = false)]
    abort_on_export_error: bool,
}

impl Cli {
    fn into_config(self) -> (SchoolConfig, PathBuf, bool) {
        let config = SchoolConfig {
            num_fish: self.num_fish,
            num_step: self.num_step,
            space_dim_x: self.space_dim_x,
            space_dim_y: self.space_dim_y,
            space_dim_z: self.space_dim_z,
            attraction_strength: self.attraction_strength,
            attraction_radius: self.attraction_radius,
            repulsion_strength: self.repulsion_strength,
            repulsion_radius: self.repulsion_radius,
            inertia_strength_ap: self.inertia_strength_ap,
            inertia_strength_rl: self.inertia_strength_rl,
            inertia_strength_dv: self.inertia_strength_dv,
            random_step_ap: self.random_step_ap,
            random_step_rl: self.random_step_rl,
            random_step_dv: self.random_step_dv,
            boundary: self.boundary_policy,
            heading_cap: self.heading_cap,
            rng_seed: self.seed,
            abort_on_export_error: self.abort_on_export_error,
        };
        (config, self.dumping_location, self.display)
    }
}

/// Terminal display sink: one log line per frame with the cloud's bounding
/// box and centroid, cheap enough to leave on for long runs.
struct PointCloudLog;

impl FrameSink for PointCloudLog {
    fn render_frame(&mut self, step: u64, positions: &[Position]) -> Result<(), SinkError> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        let mut sum = [0.0f64; 3];
        for p in positions {
            for (axis, value) in p.as_array().into_iter().enumerate() {
                min[axis] = min[axis].min(value);
                max[axis] = max[axis].max(value);
                sum[axis] += value;
            }
        }
        let n = positions.len() as f64;
        info!(
            step,
            fish = positions.len(),
            centroid_x = sum[0] / n,
            centroid_y = sum[1] / n,
            centroid_z = sum[2] / n,
            min_x = min[0],
            max_x = max[0],
            min_y = min[1],
            max_y = max[1],
            min_z = min[2],
            max_z = max[2],
            "frame"
        );
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let (config, dumping_location, display) = cli.into_config();

    let pipeline = ExportPipeline::new(&dumping_location).with_context(|| {
        format!(
            "cannot export snapshots to {}",
            dumping_location.display()
        )
    })?;
    let frame: Option<Box<dyn FrameSink>> = display.then(|| Box::new(PointCloudLog) as _);

    let mut school = School::with_sinks(config, Box::new(pipeline), frame)
        .context("failed to build the school")?;
    info!(
        seed = school.seed(),
        fish = school.population(),
        steps = school.config().num_step,
        dumping_location = %dumping_location.display(),
        "starting fish school simulation"
    );

    let num_step = school.config().num_step;
    let log_every = (num_step / 10).max(1);
    let mut summary = school.emit_current().context("initial snapshot failed")?;
    for _ in 0..num_step {
        summary = school.step().context("simulation step failed")?;
        if summary.step % log_every == 0 {
            info!(
                step = summary.step,
                mean_speed = summary.mean_speed,
                centroid_x = summary.mean_position.x,
                centroid_y = summary.mean_position.y,
                centroid_z = summary.mean_position.z,
                "progress"
            );
        }
    }
    info!(
        steps = summary.step,
        mean_speed = summary.mean_speed,
        "simulation complete"
    );
    Ok(())
}
