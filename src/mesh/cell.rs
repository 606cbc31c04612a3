//! Cell storage: the slot pools, the cell record itself, and the
//! cell-centered operations (state access, conservative update, refinement
//! indicator accumulators, gradients).

use crate::geometry::Coord;
use crate::key::Key;
use crate::model::{
    BoundaryKind, Flux, Mixture, Model, Phase, QuantitiesAddPhys, ScalarVar, StateRef, Transport,
};
use serde::{Deserialize, Serialize};

use super::AmrMesh;

/// Index of a cell in the mesh's cell pool.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct CellId(pub usize);

/// Index of an interface in the mesh's interface pool.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct InterfaceId(pub usize);

/// Slot arena with stable indices and a free list. Cells and interfaces are
/// created and destroyed by refinement, so indices must survive unrelated
/// removals.
#[derive(Clone, Debug)]
pub struct Pool<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Pool<T> {
    pub fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub fn remove(&mut self, index: usize) -> T {
        let value = self.slots[index].take();
        self.free.push(index);
        value.expect("pool slot already freed")
    }

    pub fn get(&self, index: usize) -> &T {
        self.slots[index].as_ref().expect("stale pool index")
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        self.slots[index].as_mut().expect("stale pool index")
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// One complete set of primitive variables.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub phases: Vec<Phase>,
    pub mixture: Mixture,
    pub transports: Vec<Transport>,
}

impl CellState {
    pub fn new(phases: usize, transports: usize) -> Self {
        Self {
            phases: vec![Phase::default(); phases],
            mixture: Mixture::default(),
            transports: vec![Transport::default(); transports],
        }
    }

    pub fn as_ref(&self) -> StateRef<'_> {
        StateRef {
            phases: &self.phases,
            mixture: &self.mixture,
            transports: &self.transports,
        }
    }

    /// Scalars carried per cell in a primitive exchange.
    pub fn transmitted(phases: usize, transports: usize) -> usize {
        phases * Phase::TRANSMITTED + Mixture::TRANSMITTED + transports
    }

    pub fn fill_buffer(&self, buffer: &mut Vec<f64>) {
        for phase in &self.phases {
            phase.fill_buffer(buffer);
        }
        self.mixture.fill_buffer(buffer);
        for transport in &self.transports {
            buffer.push(transport.0);
        }
    }

    pub fn read_buffer<I: Iterator<Item = f64>>(&mut self, values: &mut I) {
        for phase in self.phases.iter_mut() {
            phase.read_buffer(values);
        }
        self.mixture.read_buffer(values);
        for transport in self.transports.iter_mut() {
            transport.0 = values.next().unwrap_or_default();
        }
    }
}

/// Which primitive set an operation reads or writes: the natural state, or
/// the second-order predicted state (which falls back to the natural one
/// when the scheme is first order).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimSet {
    Natural,
    Predicted,
}

/// One node of the AMR tree.
#[derive(Clone, Debug)]
pub struct Cell {
    pub(crate) key: Key,
    pub(crate) level: u8,
    pub(crate) position: Coord,
    pub(crate) size: Coord,
    pub(crate) volume: f64,
    pub(crate) l_cfl: f64,

    pub(crate) state: CellState,
    /// Second-order predicted state; `None` for first-order runs.
    pub(crate) predicted: Option<Box<CellState>>,
    pub(crate) cons: Flux,
    pub(crate) cons_transports: Vec<Transport>,
    pub(crate) add_phys: Vec<QuantitiesAddPhys>,

    /// Refinement indicator and its smoothing accumulator.
    pub(crate) xi: f64,
    pub(crate) cons_xi: f64,

    pub(crate) split: bool,
    /// Owning rank when this cell is a ghost copy.
    pub(crate) ghost_rank: Option<usize>,

    /// Non-owning back references to every interface touching this cell.
    pub(crate) interfaces: Vec<InterfaceId>,
    /// Child cells, in `x + 2y + 4z` order. Interior cells hold all
    /// `2^dim`; ghosts hold only the face-adjacent subset.
    pub(crate) children: Vec<CellId>,
    /// Interfaces strictly inside this cell's footprint, owned by it.
    pub(crate) internal_interfaces: Vec<InterfaceId>,
}

impl Cell {
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn position(&self) -> Coord {
        self.position
    }

    pub fn size(&self) -> Coord {
        self.size
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn l_cfl(&self) -> f64 {
        self.l_cfl
    }

    pub fn split(&self) -> bool {
        self.split
    }

    pub fn is_leaf(&self) -> bool {
        !self.split && self.children.is_empty()
    }

    pub fn is_ghost(&self) -> bool {
        self.ghost_rank.is_some()
    }

    pub fn xi(&self) -> f64 {
        self.xi
    }

    pub fn set_xi(&mut self, value: f64) {
        self.xi = value;
    }

    /// Overwrite the split flag without touching children; only the ghost
    /// refresh may do this, reacting to the owner's exchanged state.
    pub(crate) fn set_split_flag(&mut self, split: bool) {
        self.split = split;
    }

    pub fn children(&self) -> &[CellId] {
        &self.children
    }

    pub fn interfaces(&self) -> &[InterfaceId] {
        &self.interfaces
    }

    pub fn internal_interfaces(&self) -> &[InterfaceId] {
        &self.internal_interfaces
    }

    pub fn state(&self, set: PrimSet) -> &CellState {
        match (set, &self.predicted) {
            (PrimSet::Predicted, Some(predicted)) => predicted,
            _ => &self.state,
        }
    }

    pub fn state_mut(&mut self, set: PrimSet) -> &mut CellState {
        match set {
            PrimSet::Predicted if self.predicted.is_some() => {
                self.predicted.as_deref_mut().expect("checked above")
            }
            _ => &mut self.state,
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.state.phases
    }

    pub fn mixture(&self) -> &Mixture {
        &self.state.mixture
    }

    pub fn transports(&self) -> &[Transport] {
        &self.state.transports
    }

    pub fn cons(&self) -> &Flux {
        &self.cons
    }

    pub fn cons_mut(&mut self) -> &mut Flux {
        &mut self.cons
    }

    /// Cell-centered scalar, for gradients and output.
    pub fn scalar(&self, var: ScalarVar) -> f64 {
        match var {
            ScalarVar::Density => self.state.mixture.density,
            ScalarVar::Pressure => self.state.mixture.pressure,
            ScalarVar::VelocityU => self.state.mixture.velocity.x,
            ScalarVar::VelocityV => self.state.mixture.velocity.y,
            ScalarVar::VelocityW => self.state.mixture.velocity.z,
            ScalarVar::Alpha(k) => self.state.phases[k].alpha,
            ScalarVar::Transport(k) => self.state.transports[k].0,
            ScalarVar::Xi => self.xi,
        }
    }

    pub(crate) fn set_to_zero_xi(&mut self) {
        self.xi = 0.0;
    }

    pub(crate) fn set_to_zero_cons_xi(&mut self) {
        self.cons_xi = 0.0;
    }

    pub(crate) fn time_evolution_xi(&mut self) {
        self.xi += self.cons_xi;
    }

    pub(crate) fn set_to_zero_cons(&mut self) {
        self.cons.set_to_zero();
        for transport in self.cons_transports.iter_mut() {
            transport.0 = 0.0;
        }
    }

    /// Conservative update over one sub-step: `U^{n+1} = U^n + dt · ΣF`,
    /// with the model's symmetry terms and scheme correction hooks.
    pub(crate) fn time_evolution(&mut self, dt: f64, model: &dyn Model, set: PrimSet) {
        let mut un = Flux::new(self.state.phases.len());
        {
            // Field-level borrow so the conservative buffer stays writable.
            let state = match (set, &self.predicted) {
                (PrimSet::Predicted, Some(predicted)) => &**predicted,
                _ => &self.state,
            };
            model.build_cons(&state.phases, &state.mixture, &mut un);
            model.symmetric_terms(state.as_ref(), &self.position, &mut self.cons);
        }
        self.cons.multiply(dt);
        self.cons.add_scaled(&un, 1.0);
        model.scheme_correction(&self.state.phases, &self.state.mixture, &mut self.cons);

        for (transport, flux) in self
            .state
            .transports
            .iter_mut()
            .zip(self.cons_transports.iter())
        {
            transport.0 += dt * flux.0;
        }
    }
}

impl AmrMesh {
    /// Normalized least-squares-free gradient of a cell-centered scalar from
    /// its face neighbors:
    /// `grad_d = Σ_f (Δvar/|Δx_f|) n_f,d |Δx_f,d| / Σ_f |Δx_f,d|` per axis.
    ///
    /// Boundary faces contribute per their kind: absorption widens only the
    /// denominator; walls and symmetry planes use a one-sided gradient with
    /// the mirrored value taken as zero, restricted to the face-normal
    /// velocity component so tangential gradients vanish at the plane.
    pub fn compute_gradient(&self, cell: CellId, var: ScalarVar) -> Coord {
        let this = self.cell(cell);
        let mut grad = Coord::ZERO;
        let mut dist_sum = Coord::ZERO;

        for &fid in &this.interfaces {
            let iface = self.interface(fid);
            if iface.split() {
                continue;
            }
            match iface.kind() {
                BoundaryKind::Internal => {
                    let left = self.cell(iface.left());
                    let right = self.cell(iface.right().expect("internal face without right cell"));
                    let delta = right.position - left.position;
                    let distance = delta.norm();
                    let g = (right.scalar(var) - left.scalar(var)) / distance;
                    let projected = iface.face().normal * g;
                    let weights =
                        Coord::new(delta.x.abs(), delta.y.abs(), delta.z.abs());
                    grad.x += projected.x * weights.x;
                    grad.y += projected.y * weights.y;
                    grad.z += projected.z * weights.z;
                    dist_sum += weights;
                }
                BoundaryKind::Absorption => {
                    dist_sum += self.boundary_weights(this, fid);
                }
                BoundaryKind::Wall | BoundaryKind::Symmetry => {
                    let weights = self.boundary_weights(this, fid);
                    if let Some(axis) = var.velocity_axis() {
                        let face = self.interface(fid).face();
                        let delta = face.position - this.position;
                        // One-sided toward the mirrored (zero) face value,
                        // masked so only the face-normal component survives.
                        let g = -this.scalar(var) / delta.norm()
                            * face.normal.component(axis).abs();
                        let projected = face.normal * g;
                        grad.x += projected.x * weights.x;
                        grad.y += projected.y * weights.y;
                        grad.z += projected.z * weights.z;
                    }
                    dist_sum += weights;
                }
                // User-supplied in/outflow states are the model's business;
                // they contribute nothing to geometric gradients.
                BoundaryKind::Inflow | BoundaryKind::Outflow => {}
            }
        }

        // Skip axes with no contributing neighbor.
        if dist_sum.x <= 1e-12 {
            dist_sum.x = 1.0;
        }
        if dist_sum.y <= 1e-12 {
            dist_sum.y = 1.0;
        }
        if dist_sum.z <= 1e-12 {
            dist_sum.z = 1.0;
        }

        Coord::new(grad.x / dist_sum.x, grad.y / dist_sum.y, grad.z / dist_sum.z)
    }

    /// Denominator weights of a boundary face: twice the cell-to-face
    /// distance per axis (the mirror cell sits one cell away).
    fn boundary_weights(&self, cell: &Cell, fid: InterfaceId) -> Coord {
        let face = self.interface(fid).face();
        let delta = face.position - cell.position;
        Coord::new(
            2.0 * delta.x.abs(),
            2.0 * delta.y.abs(),
            2.0 * delta.z.abs(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_freed_slots() {
        let mut pool = Pool::default();
        let a = pool.insert("a");
        let b = pool.insert("b");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.remove(a), "a");
        assert_eq!(pool.len(), 1);
        let c = pool.insert("c");
        assert_eq!(c, a);
        assert_eq!(*pool.get(b), "b");
        assert_eq!(*pool.get(c), "c");
    }

    #[test]
    fn state_buffer_round_trip() {
        let mut state = CellState::new(2, 1);
        state.phases[0] = Phase {
            alpha: 0.25,
            density: 1.5,
            pressure: 2.0,
        };
        state.phases[1] = Phase {
            alpha: 0.75,
            density: 0.5,
            pressure: 2.0,
        };
        state.mixture.velocity = Coord::new(1.0, -2.0, 0.5);
        state.transports[0] = Transport(4.0);

        let mut buffer = Vec::new();
        state.fill_buffer(&mut buffer);
        assert_eq!(buffer.len(), CellState::transmitted(2, 1));

        let mut decoded = CellState::new(2, 1);
        decoded.read_buffer(&mut buffer.into_iter());
        assert_eq!(decoded, state);
    }
}

#[cfg(test)]
mod gradient_tests {
    use crate::geometry::Coord;
    use crate::mesh::{BoundaryKind, MeshConfig, PrimSet};
    use crate::model::ScalarVar;
    use crate::testing::{fill_uniform, serial_mesh, IdealGas};

    #[test]
    fn wall_gradient_is_one_sided_and_normal_only() {
        // Single unit cell, outflow on -x (no gradient contribution), wall
        // on +x.
        let mut config = MeshConfig::basic([1.0, 1.0, 1.0], [1, 1, 1]);
        config.boundaries[0] = BoundaryKind::Outflow;
        config.boundaries[1] = BoundaryKind::Wall;
        let model = IdealGas::new();
        let (mut mesh, _ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        let cell = mesh.cells_at(0)[0];
        mesh.cell_mut(cell)
            .state_mut(PrimSet::Natural)
            .mixture
            .velocity = Coord::new(1.0, 1.0, 0.0);

        // Normal velocity: one-sided gradient against the mirrored zero,
        // -2 u / dx.
        let grad_u = mesh.compute_gradient(cell, ScalarVar::VelocityU);
        assert_eq!(grad_u.x, -2.0);

        // Tangential velocity: the wall contributes nothing, the gradient
        // vanishes.
        let grad_v = mesh.compute_gradient(cell, ScalarVar::VelocityV);
        assert_eq!(grad_v.x, 0.0);

        // Non-velocity variables see the wall as denominator only.
        let grad_p = mesh.compute_gradient(cell, ScalarVar::Pressure);
        assert_eq!(grad_p.x, 0.0);
    }

    #[test]
    fn symmetry_tangential_gradient_vanishes() {
        let mut config = MeshConfig::basic([2.0, 1.0, 1.0], [2, 1, 1]);
        config.boundaries[1] = BoundaryKind::Symmetry;
        let model = IdealGas::new();
        let (mut mesh, _ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        // v = 1 everywhere; the symmetry plane on +x must not bend it.
        for id in mesh.cells_at(0).to_vec() {
            mesh.cell_mut(id).state_mut(PrimSet::Natural).mixture.velocity =
                Coord::new(0.0, 1.0, 0.0);
        }
        let at_plane = mesh
            .cells_at(0)
            .iter()
            .copied()
            .find(|&id| mesh.cell(id).position().x > 1.0)
            .unwrap();
        let grad_v = mesh.compute_gradient(at_plane, ScalarVar::VelocityV);
        assert_eq!(grad_v.x, 0.0);
    }

    #[test]
    fn interior_gradient_matches_linear_field() {
        let config = MeshConfig::basic([4.0, 1.0, 1.0], [4, 1, 1]);
        let model = IdealGas::new();
        let (mut mesh, _ctx) = serial_mesh(config);
        crate::testing::fill_by_position(&mut mesh, &model, |position| (position.x, 1.0));

        // An interior cell of a linear density field recovers the exact
        // slope.
        let inner = mesh
            .cells_at(0)
            .iter()
            .copied()
            .find(|&id| (mesh.cell(id).position().x - 1.5).abs() < 1e-12)
            .unwrap();
        let grad = mesh.compute_gradient(inner, ScalarVar::Density);
        assert!((grad.x - 1.0).abs() < 1e-12);
        assert_eq!(grad.y, 0.0);
    }
}
