//! Cell interfaces: the face record shared by two cells (or a cell and a
//! boundary), the refinement-indicator evaluation across faces, and the
//! recursive external refinement that mirrors cell subdivision.

use crate::geometry::{Coord, FaceGeometry};
use crate::model::{BoundaryKind, Mixture, Phase, Transport};

use super::cell::{CellId, InterfaceId};
use super::AmrMesh;

/// Slope storage for the second-order scheme; allocated only when the outer
/// scheme order asks for it.
#[derive(Clone, Debug, Default)]
pub struct Slopes {
    pub phases: Vec<Phase>,
    pub mixture: Mixture,
    pub transports: Vec<Transport>,
}

impl Slopes {
    pub fn new(phases: usize, transports: usize) -> Self {
        Self {
            phases: vec![Phase::default(); phases],
            mixture: Mixture::default(),
            transports: vec![Transport::default(); transports],
        }
    }
}

/// A face between two cells, or between a cell and the domain boundary.
///
/// Internal faces always carry a `+axis` normal, with `left` the
/// lower-coordinate cell. Boundary faces carry the outward normal and no
/// right cell. The level is the creation level: base faces at 0, children
/// one finer than their parent face.
#[derive(Clone, Debug)]
pub struct Interface {
    pub(crate) level: u8,
    pub(crate) kind: BoundaryKind,
    pub(crate) left: CellId,
    pub(crate) right: Option<CellId>,
    pub(crate) face: FaceGeometry,
    pub(crate) split: bool,
    pub(crate) children: Vec<InterfaceId>,
    pub(crate) slopes: Option<Box<Slopes>>,
}

impl Interface {
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn kind(&self) -> BoundaryKind {
        self.kind
    }

    pub fn left(&self) -> CellId {
        self.left
    }

    pub fn right(&self) -> Option<CellId> {
        self.right
    }

    pub fn face(&self) -> &FaceGeometry {
        &self.face
    }

    pub fn split(&self) -> bool {
        self.split
    }

    pub fn children(&self) -> &[InterfaceId] {
        &self.children
    }

    pub fn has_slopes(&self) -> bool {
        self.slopes.is_some()
    }

    /// The axis this face is orthogonal to.
    pub fn axis(&self) -> usize {
        if self.face.normal.x != 0.0 {
            0
        } else if self.face.normal.y != 0.0 {
            1
        } else {
            2
        }
    }

    /// The cell on the other side of `cell`, if any.
    pub fn other_side(&self, cell: CellId) -> Option<CellId> {
        if self.left == cell {
            self.right
        } else if self.right == Some(cell) {
            Some(self.left)
        } else {
            None
        }
    }

    pub fn references(&self, cell: CellId) -> bool {
        self.left == cell || self.right == Some(cell)
    }
}

/// Relative variation of a scalar across a face, guarded against vanishing
/// magnitudes.
fn relative_variation(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs();
    if diff < 1e-12 {
        return 0.0;
    }
    diff / a.abs().min(b.abs()).max(1e-12)
}

impl AmrMesh {
    /// Evaluate the refinement indicator contribution of one internal face:
    /// if the relative variation of any enabled variable exceeds the
    /// criterion, both adjacent cells are marked ξ = 1.
    pub(crate) fn compute_xi(&mut self, fid: InterfaceId) {
        let iface = self.interface(fid);
        if iface.split || iface.kind != BoundaryKind::Internal {
            return;
        }
        let (lid, rid) = (iface.left, iface.right.expect("internal face"));
        let criteria = self.config.criteria;

        let marked = {
            let left = self.cell(lid);
            let right = self.cell(rid);
            let mut marked = false;
            if criteria.density {
                marked |= relative_variation(
                    left.state.mixture.density,
                    right.state.mixture.density,
                ) > criteria.variation;
            }
            if criteria.pressure {
                marked |= relative_variation(
                    left.state.mixture.pressure,
                    right.state.mixture.pressure,
                ) > criteria.variation;
            }
            if criteria.velocity {
                marked |= relative_variation(
                    left.state.mixture.velocity.norm(),
                    right.state.mixture.velocity.norm(),
                ) > criteria.variation;
            }
            if criteria.alpha {
                for (pl, pr) in left.state.phases.iter().zip(right.state.phases.iter()) {
                    marked |= relative_variation(pl.alpha, pr.alpha) > criteria.variation;
                }
            }
            marked
        };

        if marked {
            self.cell_mut(lid).xi = 1.0;
            self.cell_mut(rid).xi = 1.0;
        }
    }

    /// Smoothing flux of the indicator: each side accumulates half the
    /// other's ξ, spreading the indicator one cell per sweep.
    pub(crate) fn compute_flux_xi(&mut self, fid: InterfaceId) {
        let iface = self.interface(fid);
        if iface.split || iface.kind != BoundaryKind::Internal {
            return;
        }
        let (lid, rid) = (iface.left, iface.right.expect("internal face"));
        let (xi_left, xi_right) = (self.cell(lid).xi, self.cell(rid).xi);
        self.cell_mut(lid).cons_xi += 0.5 * xi_right;
        self.cell_mut(rid).cons_xi += 0.5 * xi_left;
    }

    /// Refine the external face `fid` of `parent`, whose children were just
    /// created. Equal-level neighbors keep the coarse face as a split parent
    /// of `2^(dim-1)` quadrant faces; a finer neighbor means `fid` is
    /// already a quadrant face and only needs its coarse side re-pointed to
    /// the touching child.
    pub(crate) fn refine_external(&mut self, parent: CellId, fid: InterfaceId) {
        let iface = self.interface(fid);
        debug_assert!(!iface.split);
        let axis = iface.axis();
        let parent_level = self.cell(parent).level;

        match iface.kind {
            BoundaryKind::Internal => {
                let neighbor = iface
                    .other_side(parent)
                    .expect("external face does not touch the refining cell");
                let neighbor_level = self.cell(neighbor).level;
                if neighbor_level == parent_level {
                    self.split_external(parent, fid, Some(neighbor), axis);
                } else {
                    debug_assert!(neighbor_level > parent_level);
                    self.repoint_to_child(parent, fid, axis);
                }
            }
            _ => self.split_external(parent, fid, None, axis),
        }
    }

    /// Split a coarse face into its quadrant children, each linking one
    /// face-touching child of `parent` to the (still coarse) neighbor or
    /// boundary.
    fn split_external(
        &mut self,
        parent: CellId,
        fid: InterfaceId,
        neighbor: Option<CellId>,
        axis: usize,
    ) {
        let iface = self.interface(fid);
        let parent_is_left = iface.left == parent;
        let face = iface.face;
        let kind = iface.kind;
        let level = self.cell(parent).level;
        let with_slopes = iface.slopes.is_some();
        // Children on the touched face: high bit along the axis when the
        // face lies on the parent's positive side.
        let positive_side = if kind == BoundaryKind::Internal {
            parent_is_left
        } else {
            face.normal.component(axis) > 0.0
        };
        let wanted = if positive_side { 1 } else { 0 };

        let touching: Vec<CellId> = self
            .cell(parent)
            .children
            .iter()
            .enumerate()
            .filter(|&(i, _)| (i >> axis) & 1 == wanted)
            .map(|(_, &id)| id)
            .collect();

        let scale = 0.5f64.powi(self.dim as i32 - 1);
        let mut created = Vec::with_capacity(touching.len());

        for child in touching {
            let cell = self.cell(child);
            let mut position = cell.position;
            *position.component_mut(axis) = face.position.component(axis);

            let mut size = face.size;
            for t in 0..3 {
                if t != axis {
                    *size.component_mut(t) *= if t < self.dim { 0.5 } else { 1.0 };
                }
            }

            let child_face = FaceGeometry {
                position,
                size,
                surface: face.surface * scale,
                ..face
            };

            let (left, right) = match kind {
                BoundaryKind::Internal if parent_is_left => (child, neighbor),
                BoundaryKind::Internal => (neighbor.expect("internal face"), Some(child)),
                _ => (child, None),
            };

            let id = InterfaceId(self.interfaces.insert(Interface {
                level: level + 1,
                kind,
                left,
                right,
                face: child_face,
                split: false,
                children: Vec::new(),
                slopes: with_slopes.then(|| {
                    Box::new(Slopes::new(self.config.phases, self.config.transports))
                }),
            }));

            self.cell_mut(child).interfaces.push(id);
            if let Some(n) = neighbor {
                self.cell_mut(n).interfaces.push(id);
            }
            created.push(id);
        }

        let iface = self.interface_mut(fid);
        iface.children = created;
        iface.split = true;
    }

    /// `fid` connects `parent` to a finer neighbor: move `parent`'s side of
    /// the face onto the touching child. The face stays in `parent`'s back
    /// reference list so the 2:1 guards can still see deeper refinement
    /// through it.
    fn repoint_to_child(&mut self, parent: CellId, fid: InterfaceId, axis: usize) {
        let child = self.touching_child(parent, fid, axis);
        let iface = self.interface_mut(fid);
        if iface.left == parent {
            iface.left = child;
        } else {
            iface.right = Some(child);
        }
        self.cell_mut(child).interfaces.push(fid);
    }

    /// The child of `parent` whose quadrant contains the face of `fid`.
    fn touching_child(&self, parent: CellId, fid: InterfaceId, axis: usize) -> CellId {
        let cell = self.cell(parent);
        let face = self.interface(fid).face;
        let parent_is_left = self.interface(fid).left == parent;
        let mut index = 0usize;
        for t in 0..3 {
            let bit = if t == axis {
                parent_is_left
            } else {
                face.position.component(t) > cell.position.component(t)
            };
            if bit {
                index |= 1 << t;
            }
        }
        cell.children[index]
    }

    /// Undo external refinement around a coarsening cell: quadrant faces
    /// that existed only to reach the deleted children are destroyed, while
    /// faces whose far side has itself refined are re-pointed back to the
    /// parent.
    pub(crate) fn coarsen_external(&mut self, parent: CellId) {
        let parent_level = self.cell(parent).level;
        let list = self.cell(parent).interfaces.clone();

        for fid in list {
            if !self.cell(parent).interfaces.contains(&fid) {
                continue;
            }
            let iface = self.interface(fid);

            if iface.split {
                let children = iface.children.clone();
                let mut retained = Vec::new();
                for cid in children {
                    let child_iface = self.interface(cid);
                    match child_iface.kind {
                        BoundaryKind::Internal => {
                            let left = child_iface.left;
                            let right = child_iface.right.expect("internal face");
                            let near = if self.is_child_of(parent, left) {
                                Some((left, right))
                            } else if self.is_child_of(parent, right) {
                                Some((right, left))
                            } else {
                                None
                            };
                            match near {
                                Some((_, far)) if self.cell(far).level <= parent_level => {
                                    // Existed only to connect the deleted
                                    // children to the coarse neighbor.
                                    self.detach_interface(cid, far);
                                    self.interfaces.remove(cid.0);
                                }
                                Some((near_cell, _)) => {
                                    let iface = self.interface_mut(cid);
                                    if iface.left == near_cell {
                                        iface.left = parent;
                                    } else {
                                        iface.right = Some(parent);
                                    }
                                    self.cell_mut(parent).interfaces.push(cid);
                                    retained.push(cid);
                                }
                                None => {
                                    // Both sides already coarse again; the
                                    // parent face takes over.
                                    let far_left = self.interface(cid).left;
                                    let far_right =
                                        self.interface(cid).right.expect("internal face");
                                    self.detach_interface(cid, far_left);
                                    self.detach_interface(cid, far_right);
                                    self.interfaces.remove(cid.0);
                                }
                            }
                        }
                        _ => {
                            self.interfaces.remove(cid.0);
                        }
                    }
                }
                let iface = self.interface_mut(fid);
                iface.split = !retained.is_empty();
                iface.children = retained;
            } else if self.interface(fid).kind == BoundaryKind::Internal {
                let left = self.interface(fid).left;
                let right = self.interface(fid).right.expect("internal face");
                if self.is_child_of(parent, left) {
                    self.interface_mut(fid).left = parent;
                } else if self.is_child_of(parent, right) {
                    self.interface_mut(fid).right = Some(parent);
                }
            }
        }
    }

    fn is_child_of(&self, parent: CellId, cell: CellId) -> bool {
        self.cell(parent).children.contains(&cell)
    }

    /// Remove `fid` from `cell`'s back reference list.
    pub(crate) fn detach_interface(&mut self, fid: InterfaceId, cell: CellId) {
        let list = &mut self.cell_mut(cell).interfaces;
        if let Some(at) = list.iter().position(|&id| id == fid) {
            list.swap_remove(at);
        }
    }
}
