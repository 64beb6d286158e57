//! Core types and step pipeline for the fish school simulation.
//!
//! A fixed population of agents moves through a bounded 3D volume under
//! three competing local rules (attraction, repulsion, inertia) plus a
//! stochastic perturbation. Neighborhood queries go through the uniform
//! grid in `fishschool-index`; each step is a barrier-sequenced pipeline:
//! rebuild grid, resolve forces against the previous snapshot, apply
//! position updates, emit to the export/display sinks.

use fishschool_index::{GridError, NeighborhoodIndex, UniformGrid3};
use ordered_float::OrderedFloat;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while constructing or stepping a school.
#[derive(Debug, Error)]
pub enum SchoolError {
    /// A configuration value that cannot drive a simulation; reported with
    /// the offending parameter before any step runs.
    #[error("invalid configuration: {parameter} = {value}")]
    InvalidConfig { parameter: &'static str, value: f64 },
    /// An agent left the declared domain between apply and the next grid
    /// rebuild. Fatal: it signals a boundary-policy bug or unconstrained
    /// force growth, and must not be clamped away.
    #[error("agent {agent} escaped the domain at ({x}, {y}, {z})")]
    AgentEscaped {
        agent: usize,
        x: f64,
        y: f64,
        z: f64,
    },
    /// Export sink failure surfaced as fatal because the run was configured
    /// with abort-on-export-error.
    #[error("snapshot export failed at step {step}: {message}")]
    ExportFailed { step: u64, message: String },
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Failure reported by an export or display sink; isolated per call.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(String);

impl SinkError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Point in the simulation volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub const fn as_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    #[must_use]
    pub const fn as_tuple(self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }
}

/// Per-step displacement of an agent; also its facing for the inertia rule.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Heading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Heading {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub const fn as_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    #[must_use]
    pub fn magnitude(self) -> f64 {
        norm3(self.as_array())
    }
}

impl From<[f64; 3]> for Heading {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Cosmetic display color; never read by the simulation logic.
pub type Color = [u8; 3];

/// Scalar fields for a single agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Position,
    pub heading: Heading,
    pub color: Color,
}

impl AgentData {
    #[must_use]
    pub const fn new(position: Position, heading: Heading, color: Color) -> Self {
        Self {
            position,
            heading,
            color,
        }
    }

    /// Sample a fully randomized agent: position uniform in the domain,
    /// heading bounded per axis by the configured random step magnitudes
    /// (right-left for x and y, dorso-ventral for z), color uniform bytes.
    pub fn sample(rng: &mut SmallRng, config: &SchoolConfig) -> Self {
        let position = Position::new(
            rng.random_range(0.0..=config.space_dim_x),
            rng.random_range(0.0..=config.space_dim_y),
            rng.random_range(0.0..=config.space_dim_z),
        );
        let heading = Heading::new(
            symmetric_draw(rng, config.random_step_rl),
            symmetric_draw(rng, config.random_step_rl),
            symmetric_draw(rng, config.random_step_dv),
        );
        let color = [rng.random(), rng.random(), rng.random()];
        Self::new(position, heading, color)
    }
}

/// Column storage for the fixed agent population.
///
/// The population never changes after construction (no births or deaths),
/// so plain dense indices are the agent handles; the spatial grid buckets
/// hold these indices, never copies or references.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Position>,
    headings: Vec<Heading>,
    colors: Vec<Color>,
}

impl AgentColumns {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            headings: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
        }
    }

    /// Number of agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, agent: AgentData) {
        self.positions.push(agent.position);
        self.headings.push(agent.heading);
        self.colors.push(agent.color);
        self.debug_assert_coherent();
    }

    /// Copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            heading: self.headings[index],
            color: self.colors[index],
        }
    }

    /// Ordered copy of the whole population.
    #[must_use]
    pub fn to_agents(&self) -> Vec<AgentData> {
        (0..self.len()).map(|idx| self.snapshot(idx)).collect()
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn headings(&self) -> &[Heading] {
        &self.headings
    }

    #[must_use]
    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    /// Simultaneous mutable access to both motion columns for the apply
    /// phase; each agent touches only its own slots.
    #[must_use]
    pub fn motion_mut(&mut self) -> (&mut [Position], &mut [Heading]) {
        (&mut self.positions, &mut self.headings)
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.headings.len());
        debug_assert_eq!(self.positions.len(), self.colors.len());
    }
}

/// What happens when an applied position update leaves the domain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPolicy {
    /// Mirror the overshoot back inside and flip that heading component.
    #[default]
    Reflect,
    /// Pin the position to the domain boundary, heading untouched.
    Clamp,
    /// Wrap to the opposite side (positions only; neighbor queries stay
    /// non-periodic).
    Wrap,
}

impl std::str::FromStr for BoundaryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reflect" => Ok(Self::Reflect),
            "clamp" => Ok(Self::Clamp),
            "wrap" => Ok(Self::Wrap),
            other => Err(format!(
                "unknown boundary policy '{other}' (expected reflect, clamp, or wrap)"
            )),
        }
    }
}

impl fmt::Display for BoundaryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reflect => "reflect",
            Self::Clamp => "clamp",
            Self::Wrap => "wrap",
        })
    }
}

/// Static configuration for a school run.
///
/// Defaults mirror the reference CLI: 8 fish in a unit cube for 16 steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchoolConfig {
    /// Number of fish composing the school; fixed for the whole run.
    pub num_fish: usize,
    /// Number of animation steps; the run loop is bounded, never conditional.
    pub num_step: u64,
    /// Domain extent along x.
    pub space_dim_x: f64,
    /// Domain extent along y.
    pub space_dim_y: f64,
    /// Domain extent along z.
    pub space_dim_z: f64,
    /// Strength of the attraction rule.
    pub attraction_strength: f64,
    /// Range of the attraction rule; also the grid cell sizing radius.
    pub attraction_radius: f64,
    /// Strength of the repulsion rule.
    pub repulsion_strength: f64,
    /// Range of the repulsion rule.
    pub repulsion_radius: f64,
    /// Inertia along the antero-posterior (forward) axis.
    pub inertia_strength_ap: f64,
    /// Inertia along the right-left axis.
    pub inertia_strength_rl: f64,
    /// Inertia along the dorso-ventral axis.
    pub inertia_strength_dv: f64,
    /// Random perturbation magnitude, antero-posterior.
    pub random_step_ap: f64,
    /// Random perturbation magnitude, right-left.
    pub random_step_rl: f64,
    /// Random perturbation magnitude, dorso-ventral.
    pub random_step_dv: f64,
    /// Boundary handling for applied position updates.
    pub boundary: BoundaryPolicy,
    /// Optional cap on heading magnitude after force summation. `None`
    /// leaves headings unbounded; the boundary policy alone keeps positions
    /// in-domain.
    pub heading_cap: Option<f64>,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Treat an export sink failure as fatal instead of logging it.
    pub abort_on_export_error: bool,
}

impl Default for SchoolConfig {
    fn default() -> Self {
        Self {
            num_fish: 8,
            num_step: 16,
            space_dim_x: 1.0,
            space_dim_y: 1.0,
            space_dim_z: 1.0,
            attraction_strength: 1.0,
            attraction_radius: 0.2,
            repulsion_strength: 2.0,
            repulsion_radius: 0.02,
            inertia_strength_ap: 1.0,
            inertia_strength_rl: 0.5,
            inertia_strength_dv: 2.0,
            random_step_ap: 0.01,
            random_step_rl: 0.02,
            random_step_dv: 0.005,
            boundary: BoundaryPolicy::Reflect,
            heading_cap: None,
            rng_seed: None,
            abort_on_export_error: false,
        }
    }
}

impl SchoolConfig {
    /// Validate the configuration, returning the derived grid dimensions.
    /// Every axis must fit at least one attraction-radius cell.
    pub fn grid_dimensions(&self) -> Result<[usize; 3], SchoolError> {
        if self.num_fish == 0 {
            return Err(SchoolError::InvalidConfig {
                parameter: "num_fish",
                value: 0.0,
            });
        }
        let extents = [
            ("space_dim_x", self.space_dim_x),
            ("space_dim_y", self.space_dim_y),
            ("space_dim_z", self.space_dim_z),
        ];
        for (parameter, value) in extents {
            if !value.is_finite() || value <= 0.0 {
                return Err(SchoolError::InvalidConfig { parameter, value });
            }
        }
        if !self.attraction_radius.is_finite() || self.attraction_radius <= 0.0 {
            return Err(SchoolError::InvalidConfig {
                parameter: "attraction_radius",
                value: self.attraction_radius,
            });
        }
        if !self.repulsion_radius.is_finite() || self.repulsion_radius <= 0.0 {
            return Err(SchoolError::InvalidConfig {
                parameter: "repulsion_radius",
                value: self.repulsion_radius,
            });
        }
        let strengths = [
            ("attraction_strength", self.attraction_strength),
            ("repulsion_strength", self.repulsion_strength),
            ("inertia_strength_ap", self.inertia_strength_ap),
            ("inertia_strength_rl", self.inertia_strength_rl),
            ("inertia_strength_dv", self.inertia_strength_dv),
        ];
        for (parameter, value) in strengths {
            if !value.is_finite() {
                return Err(SchoolError::InvalidConfig { parameter, value });
            }
        }
        let steps = [
            ("random_step_ap", self.random_step_ap),
            ("random_step_rl", self.random_step_rl),
            ("random_step_dv", self.random_step_dv),
        ];
        for (parameter, value) in steps {
            if !value.is_finite() || value < 0.0 {
                return Err(SchoolError::InvalidConfig { parameter, value });
            }
        }
        if let Some(cap) = self.heading_cap {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(SchoolError::InvalidConfig {
                    parameter: "heading_cap",
                    value: cap,
                });
            }
        }
        let mut dims = [0usize; 3];
        for (axis, (_, extent)) in extents.into_iter().enumerate() {
            let count = (extent / self.attraction_radius).floor();
            if count < 1.0 {
                // Radius wider than the extent: zero cells on that axis.
                return Err(SchoolError::InvalidConfig {
                    parameter: "attraction_radius",
                    value: self.attraction_radius,
                });
            }
            dims[axis] = count as usize;
        }
        Ok(dims)
    }

    /// Resolve the run seed: configured, or drawn from entropy.
    #[must_use]
    pub fn resolve_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }

    fn space_dim(&self) -> [f64; 3] {
        [self.space_dim_x, self.space_dim_y, self.space_dim_z]
    }
}

/// Summary emitted to sinks after each step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub step: u64,
    pub agent_count: usize,
    pub mean_position: Position,
    pub mean_speed: f64,
}

/// Full ordered snapshot handed to the export sink once per emitted step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepBatch {
    pub summary: StepSummary,
    pub agents: Vec<AgentData>,
}

/// Export sink invoked after each step, and once for the initial state.
/// Failures are isolated per call and never corrupt simulation state.
pub trait SnapshotSink: Send {
    fn on_step(&mut self, batch: &StepBatch) -> Result<(), SinkError>;
}

/// No-op export sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn on_step(&mut self, _batch: &StepBatch) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Display sink fed with the same cadence as the export sink when display
/// is enabled. Failures are logged, never fatal.
pub trait FrameSink: Send {
    fn render_frame(&mut self, step: u64, positions: &[Position]) -> Result<(), SinkError>;
}

// Small fixed-size vector helpers; enough linear algebra for the frame
// decomposition without pulling a math crate into the hot loop.

#[inline]
fn dot3(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn cross3(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn norm3(a: [f64; 3]) -> f64 {
    dot3(a, a).sqrt()
}

#[inline]
fn scale3(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[inline]
fn add3(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

const WORLD_FRAME: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
const FRAME_EPSILON: f64 = 1e-12;

/// Orthonormal body frame of an agent: antero-posterior (forward),
/// right-left (horizontal perpendicular), dorso-ventral (their cross).
/// A near-zero heading degenerates to the world frame.
fn agent_frame(heading: [f64; 3]) -> [[f64; 3]; 3] {
    let speed = norm3(heading);
    if speed < FRAME_EPSILON {
        return WORLD_FRAME;
    }
    let ap = scale3(heading, 1.0 / speed);
    let rl_raw = cross3([0.0, 0.0, 1.0], ap);
    let rl_len = norm3(rl_raw);
    let rl = if rl_len < FRAME_EPSILON {
        // Vertical swimmer: any horizontal perpendicular works.
        [0.0, 1.0, 0.0]
    } else {
        scale3(rl_raw, 1.0 / rl_len)
    };
    let dv = cross3(ap, rl);
    [ap, rl, dv]
}

/// Inertia contribution: the previous heading decomposed into the agent's
/// body frame, each axis rescaled independently, then resummed. Uniform
/// resistance along all three axes scales the heading directly, which also
/// keeps pure-inertia motion bit-exact.
fn inertia_term(previous: [f64; 3], config: &SchoolConfig) -> [f64; 3] {
    let (ap, rl, dv) = (
        config.inertia_strength_ap,
        config.inertia_strength_rl,
        config.inertia_strength_dv,
    );
    if ap == rl && rl == dv {
        return scale3(previous, ap);
    }
    let frame = agent_frame(previous);
    let components = [
        dot3(previous, frame[0]) * ap,
        dot3(previous, frame[1]) * rl,
        dot3(previous, frame[2]) * dv,
    ];
    add3(
        add3(scale3(frame[0], components[0]), scale3(frame[1], components[1])),
        scale3(frame[2], components[2]),
    )
}

#[inline]
fn symmetric_draw(rng: &mut SmallRng, magnitude: f64) -> f64 {
    if magnitude > 0.0 {
        rng.random_range(-magnitude..=magnitude)
    } else {
        0.0
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Per-agent RNG derived from (run seed, step, agent). Force resolution
/// stays order-independent under any parallel schedule, and seeded runs
/// reproduce bit-for-bit.
fn perturbation_rng(seed: u64, step: u64, agent: usize) -> SmallRng {
    let mixed = splitmix64(splitmix64(seed ^ step.wrapping_mul(0xD6E8_FEB8_6659_FD93)) ^ agent as u64);
    SmallRng::seed_from_u64(mixed)
}

/// Resolve one agent's new heading against the step snapshot. Pure over
/// the snapshot: never reads partially updated agents.
fn resolve_heading(
    agent: usize,
    positions: &[(f64, f64, f64)],
    headings: &[Heading],
    grid: &UniformGrid3,
    config: &SchoolConfig,
    rng: &mut SmallRng,
) -> Heading {
    let origin = positions[agent];
    let origin_arr = [origin.0, origin.1, origin.2];
    let attraction_sq = config.attraction_radius * config.attraction_radius;
    let repulsion_sq = config.repulsion_radius * config.repulsion_radius;
    let query_radius = config.attraction_radius.max(config.repulsion_radius);

    let mut zone_sum = [0.0f64; 3];
    let mut zone_count = 0usize;
    let mut repulse = [0.0f64; 3];

    grid.neighbors_within(agent, query_radius, &mut |other, dist_sq: OrderedFloat<f64>| {
        let d2 = dist_sq.into_inner();
        let p = positions[other];
        if d2 <= repulsion_sq {
            // Coincident agents are skipped: no direction to push along,
            // and the inverse-distance weight would divide by zero.
            if d2 > 0.0 {
                let inv = 1.0 / d2;
                repulse[0] += (origin.0 - p.0) * inv;
                repulse[1] += (origin.1 - p.1) * inv;
                repulse[2] += (origin.2 - p.2) * inv;
            }
        } else if d2 <= attraction_sq {
            zone_sum[0] += p.0;
            zone_sum[1] += p.1;
            zone_sum[2] += p.2;
            zone_count += 1;
        }
    });

    let mut next = [0.0f64; 3];
    if zone_count > 0 {
        // Steer toward the local center of mass, the agent included; a
        // symmetric pair then contracts for any strength below 2.
        let total = (zone_count + 1) as f64;
        for axis in 0..3 {
            let centroid = (zone_sum[axis] + origin_arr[axis]) / total;
            next[axis] += (centroid - origin_arr[axis]) * config.attraction_strength;
        }
    }
    next = add3(next, scale3(repulse, config.repulsion_strength));

    let previous = headings[agent].as_array();
    next = add3(next, inertia_term(previous, config));

    if config.random_step_ap > 0.0 || config.random_step_rl > 0.0 || config.random_step_dv > 0.0 {
        let frame = agent_frame(previous);
        let draws = [
            symmetric_draw(rng, config.random_step_ap),
            symmetric_draw(rng, config.random_step_rl),
            symmetric_draw(rng, config.random_step_dv),
        ];
        for axis in 0..3 {
            next = add3(next, scale3(frame[axis], draws[axis]));
        }
    }

    if let Some(cap) = config.heading_cap {
        let speed = norm3(next);
        if speed > cap {
            next = scale3(next, cap / speed);
        }
    }

    Heading::from(next)
}

/// Mirror an out-of-domain coordinate back inside; the boolean reports
/// whether the net reflection count is odd (heading sign flips).
fn reflect_axis(value: f64, extent: f64) -> (f64, bool) {
    let period = 2.0 * extent;
    let folded = value.rem_euclid(period);
    if folded > extent {
        (period - folded, true)
    } else {
        (folded, false)
    }
}

fn apply_boundary(
    policy: BoundaryPolicy,
    position: &mut Position,
    heading: &mut Heading,
    space_dim: [f64; 3],
) {
    match policy {
        BoundaryPolicy::Reflect => {
            let (x, fx) = reflect_axis(position.x, space_dim[0]);
            let (y, fy) = reflect_axis(position.y, space_dim[1]);
            let (z, fz) = reflect_axis(position.z, space_dim[2]);
            *position = Position::new(x, y, z);
            if fx {
                heading.x = -heading.x;
            }
            if fy {
                heading.y = -heading.y;
            }
            if fz {
                heading.z = -heading.z;
            }
        }
        BoundaryPolicy::Clamp => {
            position.x = position.x.clamp(0.0, space_dim[0]);
            position.y = position.y.clamp(0.0, space_dim[1]);
            position.z = position.z.clamp(0.0, space_dim[2]);
        }
        BoundaryPolicy::Wrap => {
            position.x = position.x.rem_euclid(space_dim[0]);
            position.y = position.y.rem_euclid(space_dim[1]);
            position.z = position.z.rem_euclid(space_dim[2]);
        }
    }
}

/// The simulator: owns the fixed population, the domain, the spatial grid,
/// and the emit sinks; drives the per-step pipeline.
pub struct School {
    config: SchoolConfig,
    seed: u64,
    columns: AgentColumns,
    grid: UniformGrid3,
    step: u64,
    sink: Box<dyn SnapshotSink>,
    frame: Option<Box<dyn FrameSink>>,
}

impl fmt::Debug for School {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("School")
            .field("config", &self.config)
            .field("seed", &self.seed)
            .field("step", &self.step)
            .field("agent_count", &self.columns.len())
            .finish()
    }
}

impl School {
    /// Construct a school with a randomized population and no sinks.
    pub fn new(config: SchoolConfig) -> Result<Self, SchoolError> {
        Self::with_sinks(config, Box::new(NullSink), None)
    }

    /// Construct a school with a randomized population and the given sinks.
    pub fn with_sinks(
        config: SchoolConfig,
        sink: Box<dyn SnapshotSink>,
        frame: Option<Box<dyn FrameSink>>,
    ) -> Result<Self, SchoolError> {
        Self::build(config, None, sink, frame)
    }

    /// Construct a school from an explicit agent population (primarily for
    /// scenario tests); the count must match `config.num_fish`.
    pub fn from_agents(config: SchoolConfig, agents: Vec<AgentData>) -> Result<Self, SchoolError> {
        Self::build(config, Some(agents), Box::new(NullSink), None)
    }

    fn build(
        config: SchoolConfig,
        agents: Option<Vec<AgentData>>,
        sink: Box<dyn SnapshotSink>,
        frame: Option<Box<dyn FrameSink>>,
    ) -> Result<Self, SchoolError> {
        config.grid_dimensions()?;
        if config.repulsion_radius > config.attraction_radius {
            warn!(
                repulsion_radius = config.repulsion_radius,
                attraction_radius = config.attraction_radius,
                "repulsion radius exceeds attraction radius; the repulsion \
                 zone swallows the whole attraction zone"
            );
        }
        let grid = UniformGrid3::new(config.space_dim(), config.attraction_radius)?;
        let seed = config.resolve_seed();
        let mut rng = SmallRng::seed_from_u64(seed);

        let mut columns = AgentColumns::with_capacity(config.num_fish);
        match agents {
            Some(agents) => {
                if agents.len() != config.num_fish {
                    return Err(SchoolError::InvalidConfig {
                        parameter: "num_fish",
                        value: agents.len() as f64,
                    });
                }
                for agent in agents {
                    columns.push(agent);
                }
            }
            None => {
                for _ in 0..config.num_fish {
                    let agent = AgentData::sample(&mut rng, &config);
                    columns.push(agent);
                }
            }
        }

        Ok(Self {
            config,
            seed,
            columns,
            grid,
            step: 0,
            sink,
            frame,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SchoolConfig {
        &self.config
    }

    /// Seed actually driving this run (configured or entropy-drawn).
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Steps completed so far.
    #[must_use]
    pub const fn current_step(&self) -> u64 {
        self.step
    }

    #[must_use]
    pub fn agents(&self) -> &AgentColumns {
        &self.columns
    }

    #[must_use]
    pub fn population(&self) -> usize {
        self.columns.len()
    }

    /// Replace the export sink.
    pub fn set_snapshot_sink(&mut self, sink: Box<dyn SnapshotSink>) {
        self.sink = sink;
    }

    /// Replace or remove the display sink.
    pub fn set_frame_sink(&mut self, frame: Option<Box<dyn FrameSink>>) {
        self.frame = frame;
    }

    fn position_tuples(&self) -> Vec<(f64, f64, f64)> {
        self.columns
            .positions()
            .iter()
            .map(|p| p.as_tuple())
            .collect()
    }

    fn summarize(&self) -> StepSummary {
        let count = self.columns.len();
        let mut mean = [0.0f64; 3];
        for p in self.columns.positions() {
            mean = add3(mean, p.as_array());
        }
        let mut speed = 0.0;
        for h in self.columns.headings() {
            speed += h.magnitude();
        }
        let inv = if count > 0 { 1.0 / count as f64 } else { 0.0 };
        StepSummary {
            step: self.step,
            agent_count: count,
            mean_position: Position::new(mean[0] * inv, mean[1] * inv, mean[2] * inv),
            mean_speed: speed * inv,
        }
    }

    /// Hand the current snapshot to the export sink and, when configured,
    /// the display sink. Called once per completed step and once for the
    /// initial configuration.
    pub fn emit_current(&mut self) -> Result<StepSummary, SchoolError> {
        let summary = self.summarize();
        let batch = StepBatch {
            summary: summary.clone(),
            agents: self.columns.to_agents(),
        };
        if let Err(err) = self.sink.on_step(&batch) {
            if self.config.abort_on_export_error {
                return Err(SchoolError::ExportFailed {
                    step: self.step,
                    message: err.to_string(),
                });
            }
            warn!(step = self.step, error = %err, "snapshot export failed; continuing");
        }
        if let Some(frame) = self.frame.as_mut() {
            let positions: Vec<Position> = batch.agents.iter().map(|a| a.position).collect();
            if let Err(err) = frame.render_frame(self.step, &positions) {
                warn!(step = self.step, error = %err, "display sink failed; continuing");
            }
        }
        Ok(summary)
    }

    /// Execute one pipeline pass: snapshot, grid rebuild, parallel force
    /// resolution against the snapshot, parallel apply, emit.
    pub fn step(&mut self) -> Result<StepSummary, SchoolError> {
        // Phase 1: the previous step's state becomes this step's immutable
        // input.
        let positions = self.position_tuples();
        let headings: Vec<Heading> = self.columns.headings().to_vec();

        // Phase 2: full rebuild; the grid never survives a position update
        // it did not observe.
        self.grid.rebuild(&positions).map_err(|err| match err {
            GridError::OutOfDomain { agent, x, y, z } => {
                SchoolError::AgentEscaped { agent, x, y, z }
            }
            other => SchoolError::from(other),
        })?;

        // Phase 3: resolve every heading into a separate buffer. Read-only
        // over the snapshot and the grid; order-independent across agents.
        let next_step = self.step + 1;
        let grid = &self.grid;
        let config = &self.config;
        let seed = self.seed;
        let resolved: Vec<Heading> = (0..self.columns.len())
            .into_par_iter()
            .map(|agent| {
                let mut rng = perturbation_rng(seed, next_step, agent);
                resolve_heading(agent, &positions, &headings, grid, config, &mut rng)
            })
            .collect();

        // Phase 4: unit-time position update, one agent per output slot.
        let policy = self.config.boundary;
        let space_dim = self.config.space_dim();
        let (positions_mut, headings_mut) = self.columns.motion_mut();
        positions_mut
            .par_iter_mut()
            .zip(headings_mut.par_iter_mut())
            .zip(resolved.par_iter())
            .for_each(|((position, heading), next)| {
                position.x += next.x;
                position.y += next.y;
                position.z += next.z;
                *heading = *next;
                apply_boundary(policy, position, heading, space_dim);
            });

        self.step = next_step;

        // Phase 5: emit; sink failures never touch simulation state.
        let summary = self.emit_current()?;
        debug!(
            step = summary.step,
            mean_speed = summary.mean_speed,
            "step complete"
        );
        Ok(summary)
    }

    /// Run the whole bounded loop: emit the initial configuration, then
    /// step `num_step` times. No early termination exists.
    pub fn run(&mut self) -> Result<StepSummary, SchoolError> {
        let mut summary = self.emit_current()?;
        for _ in 0..self.config.num_step {
            summary = self.step()?;
        }
        Ok(summary)
    }
}
