//! The mesh manager: per-level cell and interface arrays over slot pools,
//! initial topology and ghost-layer construction, and the per-level
//! primitives the outer driver sequences (flux accumulation, conservative
//! update, child averaging, adaptation).

use crate::decomposition::Decomposition;
use crate::error::{MeshError, RuntimeContext};
use crate::geometry::{face_frame, face_offsets, Coord, Direction, FaceGeometry};
use crate::key::Key;
use crate::model::{AddPhys, Flux, Model, QuantitiesAddPhys, Transport};
use crate::parallel::NeighborLink;

use std::collections::HashMap;

mod adapt;
mod cell;
mod checkpoint;
mod grid;
mod interface;

pub use crate::model::BoundaryKind;
pub use cell::{Cell, CellId, CellState, InterfaceId, Pool, PrimSet};
pub use checkpoint::{Checkpoint, CheckpointError, LeafRecord, TreeRecord};
pub use grid::StretchZone;
pub use interface::{Interface, Slopes};

/// Order of the outer finite-volume scheme. Second order allocates slope
/// storage on interfaces and a predicted state on cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SchemeOrder {
    FirstOrder,
    SecondOrder,
}

/// Which relative variations feed the refinement indicator, and the
/// threshold they must exceed.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct AdaptCriteria {
    pub variation: f64,
    pub density: bool,
    pub pressure: bool,
    pub velocity: bool,
    pub alpha: bool,
}

impl Default for AdaptCriteria {
    fn default() -> Self {
        Self {
            variation: 1e10,
            density: false,
            pressure: false,
            velocity: false,
            alpha: false,
        }
    }
}

/// Static description of the mesh: global extents, adaptation thresholds,
/// boundary kinds per face (−x, +x, −y, +y, −z, +z) and the state layout.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub lengths: [f64; 3],
    pub cells: [i64; 3],
    pub stretch: [Vec<StretchZone>; 3],
    pub lvl_max: u8,
    pub criteria: AdaptCriteria,
    pub xi_split: f64,
    pub xi_join: f64,
    pub order: SchemeOrder,
    pub boundaries: [BoundaryKind; 6],
    pub phases: usize,
    pub transports: usize,
}

impl MeshConfig {
    /// A uniform first-order single-phase box with absorbing boundaries.
    pub fn basic(lengths: [f64; 3], cells: [i64; 3]) -> Self {
        Self {
            lengths,
            cells,
            stretch: Default::default(),
            lvl_max: 0,
            criteria: AdaptCriteria::default(),
            xi_split: 1.0,
            xi_join: 1.0,
            order: SchemeOrder::FirstOrder,
            boundaries: [BoundaryKind::Absorption; 6],
            phases: 1,
            transports: 0,
        }
    }

    fn validate(&self) -> Result<(), MeshError> {
        if self.cells.iter().any(|&c| c < 1) {
            return Err(MeshError::Config(format!(
                "cell counts must be positive, got {:?}",
                self.cells
            )));
        }
        if self.cells[2] > 1 && self.cells[1] == 1 {
            return Err(MeshError::Config(
                "a 3D grid requires more than one cell in y".into(),
            ));
        }
        if self.boundaries.contains(&BoundaryKind::Internal) {
            return Err(MeshError::Config(
                "domain boundaries cannot be of kind Internal".into(),
            ));
        }
        let max_extent = *self.cells.iter().max().expect("three axes");
        if (max_extent as u64) << self.lvl_max >= 1 << crate::key::COORD_BITS {
            return Err(MeshError::Config(format!(
                "level cap {} overflows the key coordinate space for extent {max_extent}",
                self.lvl_max
            )));
        }
        if self.phases == 0 {
            return Err(MeshError::Config("at least one phase is required".into()));
        }
        if self.criteria.variation <= 0.0 || self.xi_split <= 0.0 || self.xi_join <= 0.0 {
            return Err(MeshError::Config(
                "adaptation thresholds must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Spatial dimensionality implied by the grid extents.
    pub fn dim(&self) -> usize {
        if self.cells[2] > 1 {
            3
        } else if self.cells[1] > 1 {
            2
        } else {
            1
        }
    }
}

/// The per-rank AMR mesh: cell and interface pools, per-level index arrays
/// (interior, ghost, interfaces) and the exchange descriptors toward each
/// neighboring rank.
#[derive(Debug)]
pub struct AmrMesh {
    pub(crate) config: MeshConfig,
    pub(crate) dim: usize,
    pub(crate) decomposition: Decomposition,

    pub(crate) cells: Pool<Cell>,
    pub(crate) interfaces: Pool<Interface>,

    pub(crate) cells_lvl: Vec<Vec<CellId>>,
    pub(crate) ghosts_lvl: Vec<Vec<CellId>>,
    pub(crate) interfaces_lvl: Vec<Vec<InterfaceId>>,

    pub(crate) links: Vec<NeighborLink>,
}

impl AmrMesh {
    /// Build the rank-local base topology: one cell per owned key, boundary
    /// interfaces where the domain ends, internal interfaces between local
    /// pairs (created once, on the positive offset), and ghost cells with
    /// send/recv registration where a neighbor rank owns the far side.
    pub fn new(
        config: MeshConfig,
        add_phys: &[Box<dyn AddPhys>],
        ctx: &RuntimeContext,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let dim = config.dim();
        let decomposition = Decomposition::new(config.cells, ctx.size())?;

        let spacing = [
            grid::AxisSpacing::build(config.lengths[0], config.cells[0], &config.stretch[0])?,
            grid::AxisSpacing::build(config.lengths[1], config.cells[1], &config.stretch[1])?,
            grid::AxisSpacing::build(config.lengths[2], config.cells[2], &config.stretch[2])?,
        ];

        let levels = config.lvl_max as usize + 1;
        let mut mesh = Self {
            dim,
            cells: Pool::default(),
            interfaces: Pool::default(),
            cells_lvl: vec![Vec::new(); levels],
            ghosts_lvl: vec![Vec::new(); levels],
            interfaces_lvl: vec![Vec::new(); levels],
            links: Vec::new(),
            decomposition,
            config,
        };

        let keys: Vec<Key> = mesh.decomposition.keys_of(ctx.rank()).to_vec();
        let mut local = HashMap::with_capacity(keys.len());
        for &key in &keys {
            let id = mesh.insert_base_cell(key, &spacing, add_phys, None);
            mesh.cells_lvl[0].push(id);
            local.insert(key, id);
        }

        let mut ghosts: HashMap<Key, CellId> = HashMap::new();

        for &key in &keys {
            let id = local[&key];
            for (face_index, offset) in face_offsets().into_iter().enumerate() {
                let neighbor_coord = key.neighbor(offset).coordinate();
                if !mesh.decomposition.is_inside(neighbor_coord) {
                    let kind = mesh.config.boundaries[face_index];
                    let fid = mesh.insert_base_interface(kind, id, None, offset, offset);
                    mesh.interfaces_lvl[0].push(fid);
                    continue;
                }

                let nkey = key.neighbor(offset);
                let nrank = mesh.decomposition.rank_of(&nkey);
                let positive = offset.iter().sum::<i64>() > 0;

                if nrank == ctx.rank() {
                    // Local pair: the positive-offset visit creates the face.
                    if positive {
                        let fid =
                            mesh.insert_base_interface(
                                BoundaryKind::Internal,
                                id,
                                Some(local[&nkey]),
                                offset,
                                offset,
                            );
                        mesh.interfaces_lvl[0].push(fid);
                    }
                    continue;
                }

                let direction =
                    Direction::from_offset(offset).expect("face offsets are unit vectors");
                let (ghost, created) = match ghosts.get(&nkey) {
                    Some(&g) => (g, false),
                    None => {
                        let g = mesh.insert_base_cell(nkey, &spacing, add_phys, Some(nrank));
                        ghosts.insert(nkey, g);
                        mesh.ghosts_lvl[0].push(g);
                        (g, true)
                    }
                };

                // Internal faces keep a +axis frame: the ghost becomes the
                // left cell when it sits on the negative side.
                let fid = if positive {
                    mesh.insert_base_interface(BoundaryKind::Internal, id, Some(ghost), offset, offset)
                } else {
                    let frame_offset = [-offset[0], -offset[1], -offset[2]];
                    mesh.insert_base_interface(
                        BoundaryKind::Internal,
                        ghost,
                        Some(id),
                        offset,
                        frame_offset,
                    )
                };
                mesh.interfaces_lvl[0].push(fid);

                let link = mesh.link_mut(nrank);
                if created {
                    link.recv.push(ghost);
                }
                if !link.send.iter().any(|entry| entry.cell == id) {
                    link.send.push(crate::parallel::SendEntry {
                        cell: id,
                        direction,
                    });
                }
            }
        }

        // Morton-sort both sequences so send[i] on one rank faces recv[i] on
        // the other without tagging.
        let cells = &mesh.cells;
        for link in mesh.links.iter_mut() {
            link.send
                .sort_by_key(|entry| cells.get(entry.cell.0).key());
            link.recv.sort_by_key(|&id| cells.get(id.0).key());
            link.send_counts = vec![link.send.len()];
            link.recv_counts = vec![link.recv.len()];
        }
        mesh.links.sort_by_key(|link| link.rank);

        log::info!(
            "rank {}: built base topology with {} cells, {} ghosts, {} interfaces over {} neighbor ranks",
            ctx.rank(),
            mesh.cells_lvl[0].len(),
            mesh.ghosts_lvl[0].len(),
            mesh.interfaces_lvl[0].len(),
            mesh.links.len(),
        );

        Ok(mesh)
    }

    fn insert_base_cell(
        &mut self,
        key: Key,
        spacing: &[grid::AxisSpacing; 3],
        add_phys: &[Box<dyn AddPhys>],
        ghost_rank: Option<usize>,
    ) -> CellId {
        let [ix, iy, iz] = key.coordinate();
        let size = Coord::new(
            spacing[0].widths[ix as usize],
            spacing[1].widths[iy as usize],
            spacing[2].widths[iz as usize],
        );
        let position = Coord::new(
            spacing[0].positions[ix as usize],
            spacing[1].positions[iy as usize],
            spacing[2].positions[iz as usize],
        );

        let mut l_cfl = f64::INFINITY;
        for axis in 0..self.dim {
            l_cfl = l_cfl.min(size.component(axis));
        }
        if self.dim > 1 {
            l_cfl *= 0.6;
        }

        let mut quantities: Vec<QuantitiesAddPhys> = Vec::new();
        for pack in add_phys {
            pack.add_quantity(&mut quantities);
        }

        let id = self.cells.insert(Cell {
            key,
            level: 0,
            position,
            size,
            volume: size.x * size.y * size.z,
            l_cfl,
            state: CellState::new(self.config.phases, self.config.transports),
            predicted: (self.config.order == SchemeOrder::SecondOrder)
                .then(|| Box::new(CellState::new(self.config.phases, self.config.transports))),
            cons: Flux::new(self.config.phases),
            cons_transports: vec![Transport::default(); self.config.transports],
            add_phys: quantities,
            xi: 0.0,
            cons_xi: 0.0,
            split: false,
            ghost_rank,
            interfaces: Vec::new(),
            children: Vec::new(),
            internal_interfaces: Vec::new(),
        });
        CellId(id)
    }

    /// Create a level-0 interface on the face of `left` toward `offset`.
    /// `frame_offset` picks the stored frame, which is the +axis one for
    /// internal faces and the outward one for boundaries.
    fn insert_base_interface(
        &mut self,
        kind: BoundaryKind,
        left: CellId,
        right: Option<CellId>,
        offset: [i64; 3],
        frame_offset: [i64; 3],
    ) -> InterfaceId {
        // Anchor the face on the cell adjacent to it on the offset side.
        let anchor = if kind == BoundaryKind::Internal && offset != frame_offset {
            right.expect("internal face")
        } else {
            left
        };
        let anchor = self.cell(anchor);
        let size = anchor.size;
        let mut position = anchor.position;
        let axis = offset
            .iter()
            .position(|&c| c != 0)
            .expect("offset along one axis");
        *position.component_mut(axis) +=
            0.5 * size.component(axis) * offset[axis] as f64;

        let (normal, tangent, binormal) = face_frame(frame_offset);
        let mut face_size = size;
        *face_size.component_mut(axis) = 0.0;
        let surface = match axis {
            0 => size.y * size.z,
            1 => size.x * size.z,
            _ => size.x * size.y,
        };

        let id = InterfaceId(self.interfaces.insert(Interface {
            level: 0,
            kind,
            left,
            right,
            face: FaceGeometry {
                normal,
                tangent,
                binormal,
                position,
                size: face_size,
                surface,
            },
            split: false,
            children: Vec::new(),
            slopes: (self.config.order == SchemeOrder::SecondOrder).then(|| {
                Box::new(Slopes::new(self.config.phases, self.config.transports))
            }),
        }));

        self.cell_mut(left).interfaces.push(id);
        if let Some(right) = right {
            self.cell_mut(right).interfaces.push(id);
        }
        id
    }

    fn link_mut(&mut self, rank: usize) -> &mut NeighborLink {
        if let Some(at) = self.links.iter().position(|link| link.rank == rank) {
            return &mut self.links[at];
        }
        self.links.push(NeighborLink::new(rank));
        self.links.last_mut().expect("just pushed")
    }

    // *******************************
    // Accessors

    pub fn cell(&self, id: CellId) -> &Cell {
        self.cells.get(id.0)
    }

    pub(crate) fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        self.cells.get_mut(id.0)
    }

    pub fn interface(&self, id: InterfaceId) -> &Interface {
        self.interfaces.get(id.0)
    }

    pub(crate) fn interface_mut(&mut self, id: InterfaceId) -> &mut Interface {
        self.interfaces.get_mut(id.0)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    pub fn lvl_max(&self) -> u8 {
        self.config.lvl_max
    }

    pub fn cells_at(&self, lvl: u8) -> &[CellId] {
        &self.cells_lvl[lvl as usize]
    }

    pub fn ghosts_at(&self, lvl: u8) -> &[CellId] {
        &self.ghosts_lvl[lvl as usize]
    }

    pub fn interfaces_at(&self, lvl: u8) -> &[InterfaceId] {
        &self.interfaces_lvl[lvl as usize]
    }

    /// Interior leaf cells in per-level traversal order; the live
    /// computational elements.
    pub fn leaves(&self) -> Vec<CellId> {
        let mut leaves = Vec::new();
        for lvl in 0..=self.config.lvl_max {
            for &id in self.cells_at(lvl) {
                if !self.cell(id).split() {
                    leaves.push(id);
                }
            }
        }
        leaves
    }

    /// Find a local (interior) cell by key, searching its level's array.
    pub fn find_cell(&self, key: Key) -> Option<CellId> {
        let lvl = key.level();
        if lvl > self.config.lvl_max {
            return None;
        }
        self.cells_at(lvl)
            .iter()
            .chain(self.ghosts_at(lvl).iter())
            .copied()
            .find(|&id| self.cell(id).key() == key)
    }

    // *******************************
    // Integration primitives

    /// Zero the conservative buffers of every cell at one level.
    pub fn zero_cons(&mut self, lvl: u8) {
        for id in self.cells_lvl[lvl as usize].clone() {
            self.cell_mut(id).set_to_zero_cons();
        }
    }

    /// Zero the conservative buffers of every interior leaf, recursively
    /// from the base roots. Called by the driver at the start of an outer
    /// iteration.
    pub fn zero_cons_global(&mut self) {
        for lvl in 0..=self.config.lvl_max {
            for id in self.cells_lvl[lvl as usize].clone() {
                if !self.cell(id).split() {
                    self.cell_mut(id).set_to_zero_cons();
                }
            }
        }
    }

    /// Accumulate Riemann fluxes through every live face at one level into
    /// the adjacent cells' conservative buffers.
    pub fn compute_fluxes(&mut self, lvl: u8, model: &dyn Model) {
        for fid in self.interfaces_lvl[lvl as usize].clone() {
            let iface = self.interface(fid);
            if iface.split() {
                continue;
            }
            let face = *iface.face();
            let kind = iface.kind();
            let left = iface.left();
            let right = iface.right();

            let flux = {
                let left_cell = self.cell(left);
                let right_state = right.map(|id| self.cell(id));
                model.face_flux(
                    left_cell.state.as_ref(),
                    right_state.map(|c| c.state.as_ref()),
                    kind,
                    &face,
                )
            };

            let left_volume = self.cell(left).volume();
            self.cell_mut(left)
                .cons
                .add_scaled(&flux, -face.surface / left_volume);
            if let Some(right) = right {
                let right_volume = self.cell(right).volume();
                self.cell_mut(right)
                    .cons
                    .add_scaled(&flux, face.surface / right_volume);
            }
        }
    }

    /// Accumulate additional-physics fluxes through internal faces.
    pub fn compute_add_phys_fluxes(&mut self, lvl: u8, add_phys: &[Box<dyn AddPhys>]) {
        for fid in self.interfaces_lvl[lvl as usize].clone() {
            let iface = self.interface(fid);
            if iface.split() || iface.kind() != BoundaryKind::Internal {
                continue;
            }
            let face = *iface.face();
            let left = iface.left();
            let right = iface.right().expect("internal face");

            for pack in add_phys {
                let mut flux = Flux::new(self.config.phases);
                {
                    let left_cell = self.cell(left);
                    let right_cell = self.cell(right);
                    pack.compute_flux_add_phys(
                        left_cell.state.as_ref(),
                        right_cell.state.as_ref(),
                        &face,
                        &mut flux,
                    );
                }
                let left_volume = self.cell(left).volume();
                self.cell_mut(left)
                    .cons
                    .add_scaled(&flux, -face.surface / left_volume);
                let right_volume = self.cell(right).volume();
                self.cell_mut(right)
                    .cons
                    .add_scaled(&flux, face.surface / right_volume);
            }
        }
    }

    /// One conservative sub-step at one level: evolve each live cell,
    /// rebuild its primitives, and clear its flux accumulator. Non-finite
    /// rebuilds are recorded, not propagated mid-sweep.
    pub fn advance(&mut self, lvl: u8, dt: f64, model: &dyn Model, ctx: &mut RuntimeContext) {
        for id in self.cells_lvl[lvl as usize].clone() {
            if self.cell(id).split() {
                continue;
            }
            let cell = self.cell_mut(id);
            cell.time_evolution(dt, model, PrimSet::Natural);
            let result = model.build_prim(
                &cell.cons,
                &mut cell.state.phases,
                &mut cell.state.mixture,
            );
            if let Err(error) = result {
                ctx.record(error);
            }
            let cell = self.cell_mut(id);
            cell.set_to_zero_cons();
        }
    }

    /// Average children into their parents at one level (the driver calls
    /// this after the finer level finished its sub-cycle).
    pub fn average_children(&mut self, lvl: u8, model: &dyn Model, ctx: &mut RuntimeContext) {
        for id in self.cells_lvl[lvl as usize].clone() {
            if self.cell(id).split() {
                self.average_children_in_parent(id, model, ctx);
            }
        }
    }

    /// Refresh the per-cell additional-physics quantities of one level's
    /// live cells (gradient recomputation before an additional-physics
    /// flux pass).
    pub fn prepare_add_phys(&mut self, lvl: u8, add_phys: &[Box<dyn AddPhys>]) {
        for id in self.cells_lvl[lvl as usize].clone() {
            if self.cell(id).split() {
                continue;
            }
            let cell = self.cell_mut(id);
            let (state, quantities) = (&cell.state, &mut cell.add_phys);
            for pack in add_phys {
                pack.compute_quantities(state.as_ref(), quantities);
            }
        }
    }

    /// Smallest CFL length over the live cells of one level.
    pub fn min_cfl_length(&self, lvl: u8) -> f64 {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.cells_lvl[lvl as usize]
                .par_iter()
                .filter(|&&id| !self.cell(id).split())
                .map(|&id| self.cell(id).l_cfl())
                .reduce(|| f64::INFINITY, f64::min)
        }
        #[cfg(not(feature = "parallel"))]
        {
            self.cells_lvl[lvl as usize]
                .iter()
                .filter(|&&id| !self.cell(id).split())
                .map(|&id| self.cell(id).l_cfl())
                .fold(f64::INFINITY, f64::min)
        }
    }

    // *******************************
    // Invariant verification

    /// Check the structural invariants of the tree; used after mutations in
    /// tests and debug sweeps.
    pub fn validate_topology(&self) -> Result<(), MeshError> {
        // Keys are unique within a level.
        for lvl in 0..=self.config.lvl_max {
            let mut seen = std::collections::HashSet::new();
            for &id in self.cells_at(lvl).iter().chain(self.ghosts_at(lvl).iter()) {
                if !seen.insert(self.cell(id).key()) {
                    return Err(MeshError::Topology(format!(
                        "duplicate key {:?} at level {lvl}",
                        self.cell(id).key()
                    )));
                }
            }
        }

        // Child keys and levels.
        for lvl in 0..=self.config.lvl_max {
            for &id in self.cells_at(lvl) {
                let cell = self.cell(id);
                if cell.split() != !cell.children().is_empty() {
                    return Err(MeshError::Topology(format!(
                        "cell {:?} split flag disagrees with its children",
                        cell.key()
                    )));
                }
                for (i, &child) in cell.children().iter().enumerate() {
                    let child = self.cell(child);
                    if child.level() != cell.level() + 1 || child.key() != cell.key().child(i) {
                        return Err(MeshError::Topology(format!(
                            "child {i} of cell {:?} carries key {:?}",
                            cell.key(),
                            child.key()
                        )));
                    }
                }
            }
        }

        // 2:1 balance across live faces.
        for lvl in 0..=self.config.lvl_max {
            for &fid in self.interfaces_at(lvl) {
                let iface = self.interface(fid);
                if iface.split() || iface.kind() != BoundaryKind::Internal {
                    continue;
                }
                let left = self.cell(iface.left());
                let right = self.cell(iface.right().expect("internal face"));
                if (left.level() as i16 - right.level() as i16).abs() > 1 {
                    return Err(MeshError::Topology(format!(
                        "face between {:?} and {:?} violates 2:1 balance",
                        left.key(),
                        right.key()
                    )));
                }
            }
        }

        // The interior leaves tile exactly the owned base cells.
        let base: f64 = self.cells_at(0).iter().map(|&id| self.cell(id).volume()).sum();
        let leaves: f64 = self.leaves().iter().map(|&id| self.cell(id).volume()).sum();
        if (base - leaves).abs() > 1e-12 * base {
            return Err(MeshError::Topology(format!(
                "leaf volumes sum to {leaves}, base cells to {base}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::comm::{mem_communicators, Communicator};
    use crate::parallel::reduce_time_step;
    use crate::testing::{fill_uniform, serial_mesh, IdealGas};

    #[test]
    fn config_validation() {
        assert!(MeshConfig::basic([1.0, 1.0, 1.0], [0, 1, 1])
            .validate()
            .is_err());
        // z without y.
        assert!(MeshConfig::basic([1.0, 1.0, 4.0], [4, 1, 4])
            .validate()
            .is_err());
        let mut config = MeshConfig::basic([1.0, 1.0, 1.0], [4, 1, 1]);
        config.boundaries[3] = BoundaryKind::Internal;
        assert!(config.validate().is_err());
        let config = MeshConfig {
            lvl_max: 30,
            ..MeshConfig::basic([1.0, 1.0, 1.0], [4, 1, 1])
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn base_topology_counts() {
        let (mesh, _ctx) = serial_mesh(MeshConfig::basic([4.0, 4.0, 1.0], [4, 4, 1]));
        assert_eq!(mesh.cells_at(0).len(), 16);
        assert_eq!(mesh.ghosts_at(0).len(), 0);
        // 24 internal faces plus 16 boundary faces in-plane plus 32 lateral
        // boundary faces.
        let internal = mesh
            .interfaces_at(0)
            .iter()
            .filter(|&&fid| mesh.interface(fid).kind() == BoundaryKind::Internal)
            .count();
        assert_eq!(internal, 24);
        mesh.validate_topology().unwrap();
    }

    #[test]
    fn uniform_state_is_steady_under_flux_sweep() {
        let model = IdealGas::new();
        let (mut mesh, mut ctx) = serial_mesh(MeshConfig::basic([4.0, 1.0, 1.0], [4, 1, 1]));
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        mesh.zero_cons_global();
        mesh.compute_fluxes(0, &model);
        let dt = 0.4 * mesh.min_cfl_length(0) / mesh.cell(mesh.cells_at(0)[0]).mixture().sound_speed;
        mesh.advance(0, dt, &model, &mut ctx);
        assert!(!ctx.has_errors());

        for &id in mesh.cells_at(0) {
            assert_eq!(mesh.cell(id).mixture().density, 1.0);
            assert_eq!(mesh.cell(id).mixture().pressure, 1.0);
            assert_eq!(mesh.cell(id).mixture().velocity.x, 0.0);
        }
    }

    #[test]
    fn time_step_reduction_is_global_minimum() {
        let comm = mem_communicators(1).pop().unwrap();
        assert_eq!(reduce_time_step(&comm, 0.25).unwrap(), 0.25);

        let handles: Vec<_> = mem_communicators(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let local = if comm.rank() == 0 { 0.5 } else { 0.125 };
                    reduce_time_step(&comm, local).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0.125);
        }
    }
}
