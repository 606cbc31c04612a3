//! The adaptation protocol: cell refinement and coarsening under the 2:1
//! constraint, ghost mirroring of remote refinement, and the per-level AMR
//! procedure the driver calls top-down.

use crate::error::{MeshError, RuntimeContext};
use crate::geometry::{face_frame, Coord, FaceGeometry};
use crate::model::{AddPhys, BoundaryKind, Flux, Model, QuantitiesAddPhys, Transport};
use crate::parallel::comm::Communicator;

use super::cell::{Cell, CellId, CellState, InterfaceId, PrimSet};
use super::interface::{Interface, Slopes};
use super::{AmrMesh, SchemeOrder};

impl AmrMesh {
    // *******************************
    // 2:1 guards

    /// True when a neighbor across any live face is coarser than this cell;
    /// refining would then break the 2:1 balance.
    pub fn lvl_neighbor_too_low(&self, id: CellId) -> bool {
        let cell = self.cell(id);
        for &fid in cell.interfaces() {
            let iface = self.interface(fid);
            if iface.split() {
                continue;
            }
            if iface.kind() == BoundaryKind::Internal {
                if self.cell(iface.left()).level() < cell.level()
                    || self.cell(iface.right().expect("internal face")).level() < cell.level()
                {
                    return true;
                }
            } else if self.cell(iface.left()).level() < cell.level() {
                return true;
            }
        }
        false
    }

    /// True when any face (or a face child) reaches a finer level than this
    /// cell's children; coarsening would then break the 2:1 balance.
    pub fn lvl_neighbor_too_high(&self, id: CellId) -> bool {
        let cell = self.cell(id);
        for &fid in cell.interfaces() {
            let iface = self.interface(fid);
            if iface.level() == cell.level() {
                for &child in iface.children() {
                    if self.interface(child).split() {
                        return true;
                    }
                }
            } else if iface.split() {
                return true;
            }
        }
        false
    }

    // *******************************
    // Refinement

    /// Refine a leaf cell: create its `2^dim` children with
    /// piecewise-constant prolongation, the internal child interfaces, and
    /// the refined external faces.
    pub fn refine_cell(&mut self, id: CellId, add_phys: &[Box<dyn AddPhys>]) {
        debug_assert!(!self.cell(id).split());
        debug_assert!(!self.lvl_neighbor_too_low(id));

        let children = self.create_child_cells(id, add_phys);
        self.cell_mut(id).children = children;
        self.create_internal_interfaces(id);

        for fid in self.cell(id).interfaces.clone() {
            let iface = self.interface(fid);
            if iface.split() || !iface.references(id) {
                continue;
            }
            self.refine_external(id, fid);
        }

        self.cell_mut(id).split = true;
    }

    /// Children of an interior cell, in `x + 2y + 4z` order.
    fn create_child_cells(&mut self, id: CellId, add_phys: &[Box<dyn AddPhys>]) -> Vec<CellId> {
        let parent = self.cell(id);
        let count = 1usize << self.dim;
        let key = parent.key();
        let level = parent.level();
        let position = parent.position();
        let size = parent.size();
        let volume = parent.volume();
        let l_cfl = parent.l_cfl();
        let state = parent.state.clone();
        let xi = parent.xi();
        let ghost_rank = parent.ghost_rank;

        let mut children = Vec::with_capacity(count);
        for i in 0..count {
            let geometry = self.child_geometry(position, size, i);
            children.push(self.insert_child_cell(
                key.child(i),
                level + 1,
                geometry,
                volume / count as f64,
                0.5 * l_cfl,
                &state,
                xi,
                ghost_rank,
                add_phys,
            ));
        }
        children
    }

    /// Center and extents of child `i` inside a parent box.
    fn child_geometry(&self, position: Coord, size: Coord, i: usize) -> (Coord, Coord) {
        let mut child_position = position;
        let mut child_size = size;
        for axis in 0..self.dim {
            let bit = (i >> axis) & 1;
            *child_position.component_mut(axis) +=
                size.component(axis) * (-0.25 + 0.5 * bit as f64);
            *child_size.component_mut(axis) *= 0.5;
        }
        (child_position, child_size)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_child_cell(
        &mut self,
        key: crate::key::Key,
        level: u8,
        geometry: (Coord, Coord),
        volume: f64,
        l_cfl: f64,
        state: &CellState,
        xi: f64,
        ghost_rank: Option<usize>,
        add_phys: &[Box<dyn AddPhys>],
    ) -> CellId {
        let mut quantities: Vec<QuantitiesAddPhys> = Vec::new();
        for pack in add_phys {
            pack.add_quantity(&mut quantities);
        }
        let (position, size) = geometry;
        let id = self.cells.insert(Cell {
            key,
            level,
            position,
            size,
            volume,
            l_cfl,
            state: state.clone(),
            predicted: (self.config.order == SchemeOrder::SecondOrder)
                .then(|| Box::new(state.clone())),
            cons: Flux::new(self.config.phases),
            cons_transports: vec![Transport::default(); self.config.transports],
            add_phys: quantities,
            xi,
            cons_xi: 0.0,
            split: false,
            ghost_rank,
            interfaces: Vec::new(),
            children: Vec::new(),
            internal_interfaces: Vec::new(),
        });
        CellId(id)
    }

    /// The interfaces strictly inside a refined parent: 1 in 1D, 4 in 2D
    /// (two per coordinate axis), 12 in 3D (four per coordinate plane).
    fn create_internal_interfaces(&mut self, id: CellId) {
        let parent = self.cell(id);
        let position = parent.position();
        let size = parent.size();
        let level = parent.level();
        let children = parent.children.clone();

        // (axis, left child, right child, tangential position offsets in
        // units of the parent extent).
        let table: Vec<(usize, usize, usize, Coord)> = match self.dim {
            1 => vec![(0, 0, 1, Coord::ZERO)],
            2 => vec![
                (0, 0, 1, Coord::new(0.0, -0.25, 0.0)),
                (0, 2, 3, Coord::new(0.0, 0.25, 0.0)),
                (1, 0, 2, Coord::new(-0.25, 0.0, 0.0)),
                (1, 1, 3, Coord::new(0.25, 0.0, 0.0)),
            ],
            _ => vec![
                (0, 4, 5, Coord::new(0.0, -0.25, 0.25)),
                (0, 0, 1, Coord::new(0.0, -0.25, -0.25)),
                (0, 6, 7, Coord::new(0.0, 0.25, 0.25)),
                (0, 2, 3, Coord::new(0.0, 0.25, -0.25)),
                (1, 5, 7, Coord::new(0.25, 0.0, 0.25)),
                (1, 1, 3, Coord::new(0.25, 0.0, -0.25)),
                (1, 4, 6, Coord::new(-0.25, 0.0, 0.25)),
                (1, 0, 2, Coord::new(-0.25, 0.0, -0.25)),
                (2, 0, 4, Coord::new(-0.25, -0.25, 0.0)),
                (2, 1, 5, Coord::new(0.25, -0.25, 0.0)),
                (2, 2, 6, Coord::new(-0.25, 0.25, 0.0)),
                (2, 3, 7, Coord::new(0.25, 0.25, 0.0)),
            ],
        };

        let mut created = Vec::with_capacity(table.len());
        for (axis, left, right, offsets) in table {
            let mut face_position = position;
            face_position.x += offsets.x * size.x;
            face_position.y += offsets.y * size.y;
            face_position.z += offsets.z * size.z;

            let mut face_size = size;
            *face_size.component_mut(axis) = 0.0;
            let mut surface = 1.0;
            for t in 0..3 {
                if t == axis {
                    continue;
                }
                if t < self.dim {
                    *face_size.component_mut(t) *= 0.5;
                }
                surface *= face_size.component(t);
            }

            let mut frame_offset = [0i64; 3];
            frame_offset[axis] = 1;
            let (normal, tangent, binormal) = face_frame(frame_offset);

            let fid = InterfaceId(self.interfaces.insert(Interface {
                level: level + 1,
                kind: BoundaryKind::Internal,
                left: children[left],
                right: Some(children[right]),
                face: FaceGeometry {
                    normal,
                    tangent,
                    binormal,
                    position: face_position,
                    size: face_size,
                    surface,
                },
                split: false,
                children: Vec::new(),
                slopes: (self.config.order == SchemeOrder::SecondOrder).then(|| {
                    Box::new(Slopes::new(self.config.phases, self.config.transports))
                }),
            }));

            self.cell_mut(children[left]).interfaces.push(fid);
            self.cell_mut(children[right]).interfaces.push(fid);
            created.push(fid);
        }

        self.cell_mut(id).internal_interfaces = created;
    }

    // *******************************
    // Coarsening

    /// Coarsen a split cell whose children are all leaves: average the
    /// children into the parent, destroy the internal interfaces, restore
    /// the external faces, and delete the children.
    pub fn coarsen_cell(&mut self, id: CellId, model: &dyn Model, ctx: &mut RuntimeContext) {
        debug_assert!(self.cell(id).split());
        debug_assert!(!self.lvl_neighbor_too_high(id));

        self.average_children_in_parent(id, model, ctx);

        for iid in std::mem::take(&mut self.cell_mut(id).internal_interfaces) {
            self.interfaces.remove(iid.0);
        }

        self.coarsen_external(id);

        for child in std::mem::take(&mut self.cell_mut(id).children) {
            self.cells.remove(child.0);
        }
        self.cell_mut(id).split = false;
    }

    /// Conservative average of the children into the parent: accumulate the
    /// children's conservative states, divide by their number, rebuild the
    /// parent primitives through the model and relax. Transports average
    /// arithmetically.
    pub fn average_children_in_parent(
        &mut self,
        id: CellId,
        model: &dyn Model,
        ctx: &mut RuntimeContext,
    ) {
        let children = self.cell(id).children.clone();
        if children.is_empty() {
            return;
        }
        let count = children.len() as f64;

        let mut sum = Flux::new(self.config.phases);
        let mut buffer = Flux::new(self.config.phases);
        let mut transports = vec![0.0; self.config.transports];
        for &child in &children {
            let cell = self.cell(child);
            model.build_cons(&cell.state.phases, &cell.state.mixture, &mut buffer);
            sum.add_scaled(&buffer, 1.0);
            for (avg, transport) in transports.iter_mut().zip(cell.state.transports.iter()) {
                *avg += transport.0;
            }
        }
        sum.multiply(1.0 / count);

        let cell = self.cell_mut(id);
        let result = model.build_prim(&sum, &mut cell.state.phases, &mut cell.state.mixture);
        model.relaxations(&mut cell.state.phases, &mut cell.state.mixture);
        for (transport, avg) in cell.state.transports.iter_mut().zip(transports.iter()) {
            transport.0 = avg / count;
        }
        cell.set_to_zero_cons();

        if let Err(error) = result {
            ctx.record(error);
        }
    }

    // *******************************
    // Indicator-driven choices

    /// Refine a leaf whose indicator reached the split threshold, unless a
    /// coarser neighbor blocks it.
    pub fn choose_refine(&mut self, id: CellId, add_phys: &[Box<dyn AddPhys>]) {
        let cell = self.cell(id);
        if cell.split() || cell.level() >= self.config.lvl_max {
            return;
        }
        if cell.xi() >= self.config.xi_split && !self.lvl_neighbor_too_low(id) {
            self.refine_cell(id, add_phys);
        }
    }

    /// Coarsen a split cell whose children are leaves below the join
    /// threshold, unless a finer neighbor blocks it.
    pub fn choose_coarsen(&mut self, id: CellId, model: &dyn Model, ctx: &mut RuntimeContext) {
        let cell = self.cell(id);
        if !cell.split() || cell.xi() >= self.config.xi_join {
            return;
        }
        let all_leaves = cell
            .children()
            .iter()
            .all(|&child| self.cell(child).children().is_empty());
        let join = all_leaves
            && cell
                .children()
                .iter()
                .all(|&child| self.cell(child).xi() < self.config.xi_join)
            && !self.lvl_neighbor_too_high(id);
        if join {
            self.coarsen_cell(id, model, ctx);
        }
    }

    // *******************************
    // Ghost mirroring

    /// Bring the ghost layer of one level in line with the freshly exchanged
    /// split flags, and rebuild the next level's ghost array.
    pub(crate) fn refresh_ghosts(
        &mut self,
        lvl: u8,
        model: &dyn Model,
        add_phys: &[Box<dyn AddPhys>],
    ) {
        if lvl as usize + 1 < self.ghosts_lvl.len() {
            self.ghosts_lvl[lvl as usize + 1].clear();
        }
        for gid in self.ghosts_lvl[lvl as usize].clone() {
            let ghost = self.cell(gid);
            if ghost.split() && ghost.children().is_empty() {
                self.ghost_refine(gid, add_phys);
            } else if !ghost.split() && !ghost.children().is_empty() {
                self.ghost_coarsen(gid);
            }
            if lvl as usize + 1 < self.ghosts_lvl.len() {
                for child in self.cell(gid).children.clone() {
                    self.ghosts_lvl[lvl as usize + 1].push(child);
                }
            }
        }
    }

    /// Mirror a remote refinement onto a ghost: create only the children
    /// required by local faces, splitting equal-level faces and re-pointing
    /// already-fine ones.
    fn ghost_refine(&mut self, gid: CellId, add_phys: &[Box<dyn AddPhys>]) {
        let parent = self.cell(gid);
        let key = parent.key();
        let level = parent.level();
        let position = parent.position();
        let size = parent.size();
        let volume = parent.volume();
        let l_cfl = parent.l_cfl();
        let state = parent.state.clone();
        let xi = parent.xi();
        let ghost_rank = parent.ghost_rank;
        let count = 1usize << self.dim;

        for fid in self.cell(gid).interfaces.clone() {
            let iface = self.interface(fid);
            if iface.kind() != BoundaryKind::Internal
                || iface.split()
                || !iface.references(gid)
            {
                continue;
            }
            let ghost_is_left = iface.left() == gid;
            let axis = iface.axis();
            let neighbor = iface.other_side(gid).expect("internal face");
            let neighbor_level = self.cell(neighbor).level();
            let face = *iface.face();

            // Children on the shared face: fixed bit along the face axis,
            // all combinations along the tangential axes.
            let base_bit = if ghost_is_left { 1usize } else { 0 };
            let i_range = if self.dim >= 2 { 2 } else { 1 };
            let j_range = if self.dim == 3 { 2 } else { 1 };
            let t1 = (axis + 1) % self.dim.max(1);
            let t2 = (axis + 2) % self.dim.max(1);

            let mut created_faces = Vec::new();
            for i in 0..i_range {
                for j in 0..j_range {
                    let mut bits = [0usize; 3];
                    bits[axis] = base_bit;
                    if self.dim >= 2 {
                        bits[t1] = i;
                    }
                    if self.dim == 3 {
                        bits[t2] = j;
                    }
                    let index = bits[0] + 2 * bits[1] + 4 * bits[2];
                    let child_key = key.child(index);

                    let existing = self
                        .cell(gid)
                        .children
                        .iter()
                        .copied()
                        .find(|&c| self.cell(c).key() == child_key);
                    let child = match existing {
                        Some(existing) => existing,
                        None => {
                            let geometry = self.child_geometry(position, size, index);
                            let child = self.insert_child_cell(
                                child_key,
                                level + 1,
                                geometry,
                                volume / count as f64,
                                0.5 * l_cfl,
                                &state,
                                xi,
                                ghost_rank,
                                add_phys,
                            );
                            self.cell_mut(gid).children.push(child);
                            child
                        }
                    };

                    if neighbor_level == level {
                        created_faces.push(self.insert_ghost_face(
                            child,
                            neighbor,
                            ghost_is_left,
                            axis,
                            &face,
                            level,
                        ));
                    } else {
                        // The face is already a quadrant face of the finer
                        // neighbor; hand this ghost's side to the child that
                        // owns the quadrant.
                        let mut matches = true;
                        for t in 0..self.dim {
                            if t == axis {
                                continue;
                            }
                            let expected = face.position.component(t) > position.component(t);
                            if expected != (bits[t] == 1) {
                                matches = false;
                            }
                        }
                        if matches {
                            let iface = self.interface_mut(fid);
                            if ghost_is_left {
                                iface.left = child;
                            } else {
                                iface.right = Some(child);
                            }
                            self.cell_mut(child).interfaces.push(fid);
                        }
                    }
                }
            }

            if !created_faces.is_empty() {
                let iface = self.interface_mut(fid);
                iface.children = created_faces;
                iface.split = true;
            }
        }

        // Children in curve order so the receive walk matches the sender's
        // emission order.
        let mut children = std::mem::take(&mut self.cell_mut(gid).children);
        let cells = &self.cells;
        children.sort_by_key(|&c| cells.get(c.0).key());
        self.cell_mut(gid).children = children;
    }

    /// One quadrant face between a ghost child and its same-level neighbor.
    fn insert_ghost_face(
        &mut self,
        child: CellId,
        neighbor: CellId,
        ghost_is_left: bool,
        axis: usize,
        face: &FaceGeometry,
        level: u8,
    ) -> InterfaceId {
        let cell = self.cell(child);
        let mut position = cell.position();
        *position.component_mut(axis) = face.position.component(axis);

        let mut size = face.size;
        for t in 0..3 {
            if t != axis && t < self.dim {
                *size.component_mut(t) *= 0.5;
            }
        }

        let (left, right) = if ghost_is_left {
            (child, Some(neighbor))
        } else {
            (neighbor, Some(child))
        };

        let id = InterfaceId(self.interfaces.insert(Interface {
            level: level + 1,
            kind: BoundaryKind::Internal,
            left,
            right,
            face: FaceGeometry {
                position,
                size,
                surface: face.surface * 0.5f64.powi(self.dim as i32 - 1),
                ..*face
            },
            split: false,
            children: Vec::new(),
            slopes: (self.config.order == SchemeOrder::SecondOrder)
                .then(|| Box::new(Slopes::new(self.config.phases, self.config.transports))),
        }));

        self.cell_mut(child).interfaces.push(id);
        self.cell_mut(neighbor).interfaces.push(id);
        id
    }

    /// Mirror a remote coarsening: tear down the ghost's children and their
    /// faces. The owner's primitives arrive with the next exchange.
    fn ghost_coarsen(&mut self, gid: CellId) {
        self.coarsen_external(gid);
        for child in std::mem::take(&mut self.cell_mut(gid).children) {
            self.cells.remove(child.0);
        }
    }

    // *******************************
    // Per-level procedure

    /// Rebuild the next level's interior cell and interface arrays from the
    /// children of this level.
    pub(crate) fn rebuild_level_arrays(&mut self, lvl: u8) {
        let next = lvl as usize + 1;
        if next >= self.cells_lvl.len() {
            return;
        }
        self.cells_lvl[next].clear();
        self.interfaces_lvl[next].clear();

        let level_cells = self.cells_lvl[lvl as usize].clone();
        for &id in &level_cells {
            let children = self.cells.get(id.0).children.clone();
            self.cells_lvl[next].extend(children);
        }
        for &id in &level_cells {
            let internal = self.cells.get(id.0).internal_interfaces.clone();
            self.interfaces_lvl[next].extend(internal);
        }
        for fid in self.interfaces_lvl[lvl as usize].clone() {
            let children = self.interfaces.get(fid.0).children.clone();
            self.interfaces_lvl[next].extend(children);
        }
    }

    /// The AMR procedure at one level: evaluate and smooth the indicator,
    /// refine and coarsen the interior, mirror the result onto the ghost
    /// layer, and rebuild the next level's arrays. Every exchange is a
    /// barrier entered by all ranks in lock step.
    pub fn adapt_level(
        &mut self,
        lvl: u8,
        model: &dyn Model,
        add_phys: &[Box<dyn AddPhys>],
        comm: &dyn Communicator,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        // 1) Fresh indicator.
        for id in self.cells_lvl[lvl as usize].clone() {
            self.cell_mut(id).set_to_zero_xi();
        }
        // 2) Face variations.
        for fid in self.interfaces_lvl[lvl as usize].clone() {
            self.compute_xi(fid);
        }
        // 3) Indicator on the ghosts.
        if comm.size() > 1 {
            self.exchange_xi(comm, lvl, ctx)?;
        }
        // 4) Two smoothing sweeps.
        for _ in 0..2 {
            for id in self.cells_lvl[lvl as usize].clone() {
                self.cell_mut(id).set_to_zero_cons_xi();
            }
            for gid in self.ghosts_lvl[lvl as usize].clone() {
                self.cell_mut(gid).set_to_zero_cons_xi();
            }
            for fid in self.interfaces_lvl[lvl as usize].clone() {
                self.compute_flux_xi(fid);
            }
            for id in self.cells_lvl[lvl as usize].clone() {
                self.cell_mut(id).time_evolution_xi();
            }
            if comm.size() > 1 {
                self.exchange_xi(comm, lvl, ctx)?;
            }
        }

        if lvl < self.config.lvl_max {
            // 5) Interior refinement, then coarsening.
            for id in self.cells_lvl[lvl as usize].clone() {
                self.choose_refine(id, add_phys);
            }
            for id in self.cells_lvl[lvl as usize].clone() {
                self.choose_coarsen(id, model, ctx);
            }

            // 6) Ghost refresh.
            if comm.size() > 1 {
                self.exchange_split(comm, lvl, ctx)?;
            }
            self.refresh_ghosts(lvl, model, add_phys);
            if comm.size() > 1 {
                self.exchange_primitives(comm, lvl, PrimSet::Natural, model, ctx)?;
                self.exchange_level_counts(comm, lvl + 1, ctx)?;
            }

            // 7) Next level's arrays.
            self.rebuild_level_arrays(lvl);

            log::debug!(
                "rank {}: level {lvl} adapted, {} cells and {} faces at level {}",
                ctx.rank(),
                self.cells_lvl[lvl as usize + 1].len(),
                self.interfaces_lvl[lvl as usize + 1].len(),
                lvl + 1,
            );
        }

        crate::parallel::verify_collective(comm, ctx)
    }

    /// Initial adaptation: two passes over all levels so a fresh mesh starts
    /// refined around the features of the initial condition. `fill` imposes
    /// the initial state on newly created cells.
    pub fn initialize_refinement(
        &mut self,
        model: &dyn Model,
        add_phys: &[Box<dyn AddPhys>],
        comm: &dyn Communicator,
        ctx: &mut RuntimeContext,
        fill: &mut dyn FnMut(&mut Cell),
    ) -> Result<(), MeshError> {
        for _ in 0..2 {
            for lvl in 0..self.config.lvl_max {
                if comm.size() > 1 {
                    self.exchange_primitives(comm, lvl, PrimSet::Natural, model, ctx)?;
                }
                self.adapt_level(lvl, model, add_phys, comm, ctx)?;
                for id in self.cells_lvl[lvl as usize + 1].clone() {
                    fill(self.cell_mut(id));
                }
                for id in self.cells_lvl[lvl as usize + 1].clone() {
                    let cell = self.cell_mut(id);
                    model.fulfill_state(&mut cell.state.phases, &mut cell.state.mixture);
                }
                for id in self.cells_lvl[lvl as usize].clone() {
                    if self.cell(id).split() {
                        self.average_children_in_parent(id, model, ctx);
                    }
                }
            }
        }
        for lvl in 0..=self.config.lvl_max {
            if comm.size() > 1 {
                self.exchange_primitives(comm, lvl, PrimSet::Natural, model, ctx)?;
            }
            for id in self.cells_lvl[lvl as usize].clone() {
                if !self.cell(id).split() {
                    let cell = self.cell_mut(id);
                    model.fulfill_state(&mut cell.state.phases, &mut cell.state.mixture);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::mesh::MeshConfig;
    use crate::parallel::comm::mem_communicators;
    use crate::testing::{fill_by_position, fill_uniform, serial_mesh, IdealGas};

    fn find(mesh: &AmrMesh, key: Key) -> CellId {
        mesh.find_cell(key).expect("cell present")
    }

    #[test]
    fn refine_coarsen_round_trip_is_exact() {
        let config = MeshConfig::basic([4.0, 1.0, 1.0], [4, 1, 1]);
        let config = MeshConfig {
            lvl_max: 2,
            ..config
        };
        let model = IdealGas::new();
        let (mut mesh, mut ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        let target = find(&mesh, Key::base([1, 0, 0]));
        mesh.refine_cell(target, &[]);
        mesh.rebuild_level_arrays(0);

        // One internal face in 1D, two children, one quadrant face per
        // refined external face.
        assert_eq!(mesh.cell(target).children().len(), 2);
        assert_eq!(mesh.cells_at(1).len(), 2);
        assert_eq!(mesh.interfaces_at(1).len(), 1 + 2);
        assert_eq!(mesh.leaves().len(), 5);

        // Deepen to level 2 without breaking the 2:1 balance: the right
        // base neighbor refines first.
        let neighbor = find(&mesh, Key::base([2, 0, 0]));
        mesh.refine_cell(neighbor, &[]);
        let deep = find(&mesh, Key::base([1, 0, 0]).child(1));
        assert!(!mesh.lvl_neighbor_too_low(deep));
        mesh.refine_cell(deep, &[]);
        mesh.rebuild_level_arrays(0);
        mesh.rebuild_level_arrays(1);
        assert_eq!(mesh.leaves().len(), 7);
        mesh.validate_topology().unwrap();

        mesh.coarsen_cell(deep, &model, &mut ctx);
        mesh.coarsen_cell(neighbor, &model, &mut ctx);
        mesh.coarsen_cell(target, &model, &mut ctx);
        mesh.rebuild_level_arrays(1);
        mesh.rebuild_level_arrays(0);

        // Piecewise-constant round trip restores the state exactly.
        let cell = mesh.cell(target);
        assert_eq!(cell.phases()[0].density, 1.0);
        assert_eq!(cell.phases()[0].pressure, 1.0);
        assert_eq!(cell.mixture().pressure, 1.0);
        assert!(!ctx.has_errors());
        assert_eq!(mesh.leaves().len(), 4);
        mesh.validate_topology().unwrap();
    }

    #[test]
    fn child_keys_depend_only_on_parent() {
        let config = MeshConfig {
            lvl_max: 1,
            ..MeshConfig::basic([4.0, 4.0, 1.0], [4, 4, 1])
        };
        let model = IdealGas::new();
        let (mut mesh, _ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        let target = find(&mesh, Key::base([2, 1, 0]));
        mesh.refine_cell(target, &[]);
        let parent_key = mesh.cell(target).key();
        for (i, &child) in mesh.cell(target).children().iter().enumerate() {
            assert_eq!(mesh.cell(child).key(), parent_key.child(i));
            assert_eq!(mesh.cell(child).level(), 1);
        }
    }

    #[test]
    fn refinement_is_local() {
        let config = MeshConfig {
            lvl_max: 1,
            ..MeshConfig::basic([4.0, 1.0, 1.0], [4, 1, 1])
        };
        let model = IdealGas::new();
        let (mut mesh, _ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        let far = find(&mesh, Key::base([3, 0, 0]));
        let before_faces = mesh.cell(far).interfaces().to_vec();
        let before_state = mesh.cell(far).state(PrimSet::Natural).clone();

        mesh.refine_cell(find(&mesh, Key::base([1, 0, 0])), &[]);

        assert_eq!(mesh.cell(far).interfaces(), before_faces.as_slice());
        assert_eq!(*mesh.cell(far).state(PrimSet::Natural), before_state);
    }

    #[test]
    fn two_to_one_guards() {
        let config = MeshConfig {
            lvl_max: 2,
            ..MeshConfig::basic([8.0, 8.0, 1.0], [8, 8, 1])
        };
        let model = IdealGas::new();
        let (mut mesh, mut ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        let coarse = find(&mesh, Key::base([3, 3, 0]));
        mesh.refine_cell(coarse, &[]);
        mesh.rebuild_level_arrays(0);

        // A far cell refines freely.
        let far = find(&mesh, Key::base([5, 3, 0]));
        assert!(!mesh.lvl_neighbor_too_low(far));

        // The child of (3,3) facing the still-coarse (4,3) is blocked.
        let blocked = find(&mesh, Key::base([3, 3, 0]).child(1));
        assert!(mesh.lvl_neighbor_too_low(blocked));

        // Refining (4,3) unblocks it.
        let neighbor = find(&mesh, Key::base([4, 3, 0]));
        assert!(!mesh.lvl_neighbor_too_low(neighbor));
        mesh.refine_cell(neighbor, &[]);
        mesh.rebuild_level_arrays(0);
        assert!(!mesh.lvl_neighbor_too_low(blocked));
        mesh.refine_cell(blocked, &[]);
        mesh.rebuild_level_arrays(1);
        mesh.validate_topology().unwrap();

        // With a level-2 cell against their shared face, neither level-0
        // parent may coarsen.
        assert!(mesh.lvl_neighbor_too_high(coarse));
        assert!(mesh.lvl_neighbor_too_high(neighbor));
        mesh.choose_coarsen(coarse, &model, &mut ctx);
        assert!(mesh.cell(coarse).split());
    }

    #[test]
    fn conservation_under_coarsen() {
        let config = MeshConfig {
            lvl_max: 1,
            ..MeshConfig::basic([2.0, 1.0, 1.0], [2, 1, 1])
        };
        let model = IdealGas::new();
        let (mut mesh, mut ctx) = serial_mesh(config);
        fill_uniform(&mut mesh, &model, 1.0, 1.0);

        let parent = find(&mesh, Key::base([0, 0, 0]));
        mesh.refine_cell(parent, &[]);

        let children = mesh.cell(parent).children().to_vec();
        for (child, density) in children.iter().zip([1.0, 3.0]) {
            let cell = mesh.cell_mut(*child);
            let state = cell.state_mut(PrimSet::Natural);
            state.phases[0].density = density;
            model.fulfill_state(&mut state.phases, &mut state.mixture);
        }
        let mass_before: f64 = children
            .iter()
            .map(|&c| mesh.cell(c).mixture().density * mesh.cell(c).volume())
            .sum();

        mesh.average_children_in_parent(parent, &model, &mut ctx);
        assert!(!ctx.has_errors());

        let cell = mesh.cell(parent);
        assert_eq!(cell.mixture().density, 2.0);
        assert_eq!(cell.mixture().density * cell.volume(), mass_before);
    }

    #[test]
    fn indicator_drives_refinement() {
        let config = MeshConfig {
            lvl_max: 1,
            criteria: super::super::AdaptCriteria {
                variation: 0.5,
                density: true,
                ..Default::default()
            },
            ..MeshConfig::basic([8.0, 1.0, 1.0], [8, 1, 1])
        };
        let model = IdealGas::new();
        let (mut mesh, mut ctx) = serial_mesh(config);
        fill_by_position(&mut mesh, &model, |position| {
            if position.x < 4.0 {
                (1.0, 1.0)
            } else {
                (2.0, 1.0)
            }
        });

        let comm = mem_communicators(1).pop().expect("one rank");
        mesh.adapt_level(0, &model, &[], &comm, &mut ctx).unwrap();

        // Both cells astride the jump refined; the indicator smoothed one
        // cell outward past the split threshold.
        let jump_left = find(&mesh, Key::base([3, 0, 0]));
        let jump_right = find(&mesh, Key::base([4, 0, 0]));
        assert!(mesh.cell(jump_left).split());
        assert!(mesh.cell(jump_right).split());
        assert!(!mesh.cells_at(1).is_empty());
        mesh.validate_topology().unwrap();

        // Choosing again without fresh indicators is a no-op.
        let leaves = mesh.leaves().len();
        mesh.choose_refine(jump_left, &[]);
        assert_eq!(mesh.leaves().len(), leaves);
    }

    #[test]
    fn coarsening_rejoins_smooth_regions() {
        let config = MeshConfig {
            lvl_max: 1,
            criteria: super::super::AdaptCriteria {
                variation: 0.5,
                density: true,
                ..Default::default()
            },
            xi_join: 0.5,
            ..MeshConfig::basic([8.0, 1.0, 1.0], [8, 1, 1])
        };
        let model = IdealGas::new();
        let (mut mesh, mut ctx) = serial_mesh(config);
        fill_by_position(&mut mesh, &model, |position| {
            if position.x < 4.0 {
                (1.0, 1.0)
            } else {
                (2.0, 1.0)
            }
        });

        let comm = mem_communicators(1).pop().expect("one rank");
        mesh.adapt_level(0, &model, &[], &comm, &mut ctx).unwrap();
        let refined = mesh.cells_at(1).len();
        assert!(refined > 0);

        // Flatten the field. The level-1 sweep recomputes the children's
        // indicators; the next level-0 sweep then joins everything back.
        fill_uniform(&mut mesh, &model, 1.0, 1.0);
        mesh.adapt_level(1, &model, &[], &comm, &mut ctx).unwrap();
        mesh.adapt_level(0, &model, &[], &comm, &mut ctx).unwrap();
        assert_eq!(mesh.cells_at(1).len(), 0);
        assert_eq!(mesh.leaves().len(), 8);
        mesh.validate_topology().unwrap();
    }

    #[test]
    fn internal_interface_counts_by_dimension() {
        for (cells, expected) in [
            ([4i64, 1, 1], 1usize),
            ([4, 4, 1], 4),
            ([4, 4, 4], 12),
        ] {
            let lengths = [cells[0] as f64, cells[1] as f64, cells[2] as f64];
            let config = MeshConfig {
                lvl_max: 1,
                ..MeshConfig::basic(lengths, cells)
            };
            let model = IdealGas::new();
            let (mut mesh, _ctx) = serial_mesh(config);
            fill_uniform(&mut mesh, &model, 1.0, 1.0);

            let target = find(&mesh, Key::base([1, 0, 0]));
            mesh.refine_cell(target, &[]);
            assert_eq!(
                mesh.cell(target).internal_interfaces().len(),
                expected,
                "{cells:?}"
            );
            mesh.validate_topology().unwrap();
        }
    }
}
