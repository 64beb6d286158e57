//! Spatial indexing for radius-limited fish neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum GridError {
    /// Configuration values that cannot produce a usable grid.
    #[error("invalid grid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An agent position resolved outside the declared domain. Reported,
    /// never clamped: a silent clamp would corrupt every neighbor query
    /// against the cell the agent pretends to be in.
    #[error("agent {agent} at ({x}, {y}, {z}) lies outside the domain")]
    OutOfDomain {
        agent: usize,
        x: f64,
        y: f64,
        z: f64,
    },
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions. The index holds no
    /// state across position updates it did not observe; callers rebuild at
    /// the start of every step.
    fn rebuild(&mut self, positions: &[(f64, f64, f64)]) -> Result<(), GridError>;

    /// Visit every agent within `radius` of `agent_idx`, excluding the agent
    /// itself. The visitor receives the neighbor index and squared distance.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );
}

/// Uniform 3D cell grid over `[0, dx] x [0, dy] x [0, dz]`.
///
/// Cells are sized to the attraction radius, then stretched per axis so an
/// integral number of cells tiles the domain exactly (`step >= radius`).
/// Buckets hold indices into the caller's agent storage, never copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGrid3 {
    space_dim: [f64; 3],
    dims: [usize; 3],
    steps: [f64; 3],
    #[serde(skip)]
    cells: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f64, f64, f64)>,
}

impl UniformGrid3 {
    /// Create a grid for the given domain extents and query radius.
    ///
    /// Fails when any extent or the radius is non-positive, or when the
    /// radius exceeds an extent (that axis would get zero cells).
    pub fn new(space_dim: [f64; 3], attraction_radius: f64) -> Result<Self, GridError> {
        if !attraction_radius.is_finite() || attraction_radius <= 0.0 {
            return Err(GridError::InvalidConfig(
                "attraction_radius must be positive",
            ));
        }
        let mut dims = [0usize; 3];
        let mut steps = [0f64; 3];
        for axis in 0..3 {
            let extent = space_dim[axis];
            if !extent.is_finite() || extent <= 0.0 {
                return Err(GridError::InvalidConfig(
                    "space dimensions must be positive",
                ));
            }
            let count = (extent / attraction_radius).floor();
            if count < 1.0 {
                return Err(GridError::InvalidConfig(
                    "attraction_radius larger than a space dimension",
                ));
            }
            dims[axis] = count as usize;
            steps[axis] = extent / count;
        }
        let cell_count = dims[0] * dims[1] * dims[2];
        Ok(Self {
            space_dim,
            dims,
            steps,
            cells: vec![Vec::new(); cell_count],
            positions: Vec::new(),
        })
    }

    /// Grid dimensions per axis.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Per-axis cell edge lengths.
    #[must_use]
    pub const fn steps(&self) -> [f64; 3] {
        self.steps
    }

    #[inline]
    fn flat_index(&self, cell: [usize; 3]) -> usize {
        (cell[2] * self.dims[1] + cell[1]) * self.dims[0] + cell[0]
    }

    /// Map a position onto its cell. A coordinate exactly at the domain
    /// maximum belongs to the last cell along that axis.
    pub fn cell_of(&self, agent: usize, position: (f64, f64, f64)) -> Result<[usize; 3], GridError> {
        let coords = [position.0, position.1, position.2];
        let mut cell = [0usize; 3];
        for axis in 0..3 {
            let value = coords[axis];
            if !(value >= 0.0 && value <= self.space_dim[axis]) {
                return Err(GridError::OutOfDomain {
                    agent,
                    x: position.0,
                    y: position.1,
                    z: position.2,
                });
            }
            let idx = (value / self.steps[axis]).floor() as usize;
            cell[axis] = idx.min(self.dims[axis] - 1);
        }
        Ok(cell)
    }

    /// Buckets of the cell containing `cell`, for diagnostics and tests.
    #[must_use]
    pub fn bucket(&self, cell: [usize; 3]) -> &[usize] {
        &self.cells[self.flat_index(cell)]
    }
}

impl NeighborhoodIndex for UniformGrid3 {
    fn rebuild(&mut self, positions: &[(f64, f64, f64)]) -> Result<(), GridError> {
        for bucket in &mut self.cells {
            bucket.clear();
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (agent, &position) in positions.iter().enumerate() {
            let cell = self.cell_of(agent, position)?;
            let flat = self.flat_index(cell);
            self.cells[flat].push(agent);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        if radius <= 0.0 || agent_idx >= self.positions.len() {
            return;
        }
        let origin = self.positions[agent_idx];
        let Ok(center) = self.cell_of(agent_idx, origin) else {
            return;
        };
        let radius_sq = radius * radius;

        // Coarse phase: the axis-aligned block of cells that could hold a
        // point within `radius`. Cells past the domain edge are excluded,
        // not wrapped; no periodic boundary.
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            let reach = (radius / self.steps[axis]).ceil() as usize;
            lo[axis] = center[axis].saturating_sub(reach);
            hi[axis] = (center[axis] + reach).min(self.dims[axis] - 1);
        }

        for cz in lo[2]..=hi[2] {
            for cy in lo[1]..=hi[1] {
                for cx in lo[0]..=hi[0] {
                    let flat = self.flat_index([cx, cy, cz]);
                    for &other in &self.cells[flat] {
                        if other == agent_idx {
                            continue;
                        }
                        let p = self.positions[other];
                        let dx = p.0 - origin.0;
                        let dy = p.1 - origin.1;
                        let dz = p.2 - origin.2;
                        let dist_sq = dx * dx + dy * dy + dz * dz;
                        if dist_sq <= radius_sq {
                            visitor(other, OrderedFloat(dist_sq));
                        }
                    }
                }
            }
        }
    }
}

/// Exhaustive scan over every pair; the reference oracle for grid queries.
#[derive(Debug, Default, Clone)]
pub struct BruteForceIndex {
    positions: Vec<(f64, f64, f64)>,
}

impl BruteForceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NeighborhoodIndex for BruteForceIndex {
    fn rebuild(&mut self, positions: &[(f64, f64, f64)]) -> Result<(), GridError> {
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        if radius <= 0.0 || agent_idx >= self.positions.len() {
            return;
        }
        let origin = self.positions[agent_idx];
        let radius_sq = radius * radius;
        for (other, p) in self.positions.iter().enumerate() {
            if other == agent_idx {
                continue;
            }
            let dx = p.0 - origin.0;
            let dy = p.1 - origin.1;
            let dz = p.2 - origin.2;
            let dist_sq = dx * dx + dy * dy + dz * dz;
            if dist_sq <= radius_sq {
                visitor(other, OrderedFloat(dist_sq));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn collect_neighbors(
        index: &dyn NeighborhoodIndex,
        agent: usize,
        radius: f64,
    ) -> Vec<(usize, OrderedFloat<f64>)> {
        let mut out = Vec::new();
        index.neighbors_within(agent, radius, &mut |idx, dist_sq| out.push((idx, dist_sq)));
        out.sort_by_key(|&(idx, _)| idx);
        out
    }

    #[test]
    fn rejects_degenerate_configurations() {
        assert!(UniformGrid3::new([1.0, 1.0, 1.0], 0.0).is_err());
        assert!(UniformGrid3::new([1.0, 1.0, 1.0], -0.5).is_err());
        assert!(UniformGrid3::new([0.0, 1.0, 1.0], 0.2).is_err());
        // Radius wider than the z extent leaves zero cells on that axis.
        assert!(UniformGrid3::new([1.0, 1.0, 0.1], 0.2).is_err());
    }

    #[test]
    fn dims_follow_floor_division() {
        let grid = UniformGrid3::new([1.0, 2.0, 0.5], 0.2).expect("grid");
        assert_eq!(grid.dims(), [5, 10, 2]);
        let steps = grid.steps();
        assert!((steps[0] - 0.2).abs() < 1e-12);
        assert!((steps[1] - 0.2).abs() < 1e-12);
        assert!((steps[2] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn cells_stretch_to_cover_the_domain() {
        // 1.0 / 0.3 floors to 3 cells of width 1/3 each.
        let grid = UniformGrid3::new([1.0, 1.0, 1.0], 0.3).expect("grid");
        assert_eq!(grid.dims(), [3, 3, 3]);
        for step in grid.steps() {
            assert!(step >= 0.3);
            assert!((step - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn rebuild_buckets_round_trip() {
        let mut grid = UniformGrid3::new([1.0, 1.0, 1.0], 0.25).expect("grid");
        let mut rng = SmallRng::seed_from_u64(7);
        let positions: Vec<(f64, f64, f64)> = (0..64)
            .map(|_| {
                (
                    rng.random_range(0.0..1.0),
                    rng.random_range(0.0..1.0),
                    rng.random_range(0.0..1.0),
                )
            })
            .collect();
        grid.rebuild(&positions).expect("rebuild");

        let steps = grid.steps();
        let mut seen = 0usize;
        let [dx, dy, dz] = grid.dims();
        for cz in 0..dz {
            for cy in 0..dy {
                for cx in 0..dx {
                    for &agent in grid.bucket([cx, cy, cz]) {
                        let p = positions[agent];
                        assert!(p.0 >= cx as f64 * steps[0] && p.0 <= (cx + 1) as f64 * steps[0]);
                        assert!(p.1 >= cy as f64 * steps[1] && p.1 <= (cy + 1) as f64 * steps[1]);
                        assert!(p.2 >= cz as f64 * steps[2] && p.2 <= (cz + 1) as f64 * steps[2]);
                        seen += 1;
                    }
                }
            }
        }
        // Every agent sits in exactly one bucket.
        assert_eq!(seen, positions.len());
    }

    #[test]
    fn rebuild_reports_escaped_agents() {
        let mut grid = UniformGrid3::new([1.0, 1.0, 1.0], 0.2).expect("grid");
        let err = grid
            .rebuild(&[(0.5, 0.5, 0.5), (0.5, 1.2, 0.5)])
            .expect_err("agent outside the domain");
        match err {
            GridError::OutOfDomain { agent, y, .. } => {
                assert_eq!(agent, 1);
                assert!((y - 1.2).abs() < 1e-12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn domain_maximum_is_a_valid_position() {
        let mut grid = UniformGrid3::new([1.0, 1.0, 1.0], 0.2).expect("grid");
        let positions = vec![(1.0, 1.0, 1.0), (0.95, 0.95, 0.95), (0.0, 0.0, 0.0)];
        grid.rebuild(&positions).expect("corner agent is in-domain");
        assert_eq!(grid.cell_of(0, positions[0]).expect("cell"), [4, 4, 4]);

        let neighbors = collect_neighbors(&grid, 0, 0.2);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, 1);
    }

    #[test]
    fn neighbor_query_excludes_self_and_filters_by_distance() {
        let mut grid = UniformGrid3::new([1.0, 1.0, 1.0], 0.25).expect("grid");
        let positions = vec![
            (0.5, 0.5, 0.5),
            (0.6, 0.5, 0.5),  // inside radius
            (0.5, 0.76, 0.5), // outside radius, same cell block
            (0.1, 0.1, 0.1),  // far away
        ];
        grid.rebuild(&positions).expect("rebuild");
        let neighbors = collect_neighbors(&grid, 0, 0.25);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, 1);
        assert!((neighbors[0].1.into_inner() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn grid_matches_brute_force_oracle() {
        let mut rng = SmallRng::seed_from_u64(0xF15);
        let positions: Vec<(f64, f64, f64)> = (0..200)
            .map(|_| {
                (
                    rng.random_range(0.0..2.0),
                    rng.random_range(0.0..1.0),
                    rng.random_range(0.0..1.5),
                )
            })
            .collect();

        let mut grid = UniformGrid3::new([2.0, 1.0, 1.5], 0.3).expect("grid");
        grid.rebuild(&positions).expect("rebuild");
        let mut oracle = BruteForceIndex::new();
        oracle.rebuild(&positions).expect("rebuild");

        for radius in [0.05, 0.3, 0.45] {
            for agent in 0..positions.len() {
                assert_eq!(
                    collect_neighbors(&grid, agent, radius),
                    collect_neighbors(&oracle, agent, radius),
                    "agent {agent} radius {radius}"
                );
            }
        }
    }
}
