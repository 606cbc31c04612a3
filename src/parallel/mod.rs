//! Ghost-cell exchange between ranks: per-neighbor send/recv descriptors,
//! level-aware packing with directional child filtering, and the collective
//! operations performed at barriers.
//!
//! Both sides of a link keep their cell sequences Morton-sorted, so
//! `send[i]` on one rank always faces `recv[i]` on the other and payloads
//! need no per-cell addressing.

pub mod comm;

use bitvec::{order::Lsb0, vec::BitVec};

use crate::error::{MeshError, RuntimeContext};
use crate::geometry::{Coord, Direction};
use crate::mesh::{AmrMesh, Cell, CellId, CellState, PrimSet};
use crate::model::Model;

use comm::{decode_f64s, encode_f64s, frame, recv_matching, Communicator};

/// Payload kinds; combined with the level into a message tag.
mod tag {
    pub const PRIMITIVES: u64 = 1;
    pub const XI: u64 = 2;
    pub const SPLIT: u64 = 3;
    pub const COUNTS: u64 = 4;
    pub const TRANSPORTS: u64 = 5;
    pub const VECTOR: u64 = 6;
    pub const TIME_STEP: u64 = 7;
    pub const VERDICT: u64 = 8;
}

fn tag_for(kind: u64, lvl: u8) -> u64 {
    (kind << 8) | lvl as u64
}

/// One owned cell to emit toward a neighbor rank, with this rank's position
/// relative to that neighbor (fixing which descendants are emitted).
#[derive(Clone, Copy, Debug)]
pub(crate) struct SendEntry {
    pub cell: CellId,
    pub direction: Direction,
}

/// Exchange descriptor toward one neighbor rank. The `send` and `recv`
/// sequences are Morton-sorted; the per-level counts mirror the peer's and
/// size the buffers.
#[derive(Clone, Debug)]
pub(crate) struct NeighborLink {
    pub rank: usize,
    pub send: Vec<SendEntry>,
    pub recv: Vec<CellId>,
    pub send_counts: Vec<usize>,
    pub recv_counts: Vec<usize>,
}

impl NeighborLink {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            send: Vec::new(),
            recv: Vec::new(),
            send_counts: Vec::new(),
            recv_counts: Vec::new(),
        }
    }
}

impl AmrMesh {
    /// Visit the level-`lvl` descendants of a send root that lie on the
    /// face toward the neighbor. A split coarser cell recurses only into
    /// the children selected by the direction mask.
    fn walk_send(&self, id: CellId, direction: Direction, lvl: u8, visit: &mut dyn FnMut(&Cell)) {
        let cell = self.cell(id);
        if cell.level() == lvl {
            visit(cell);
        } else if cell.split() {
            for (index, &child) in cell.children().iter().enumerate() {
                if direction.emits(index) {
                    self.walk_send(child, direction, lvl, visit);
                }
            }
        }
    }

    /// Collect the level-`lvl` ghosts below a recv root, in key order, with
    /// no directional filter.
    fn walk_recv(&self, id: CellId, lvl: u8, out: &mut Vec<CellId>) {
        let cell = self.cell(id);
        if cell.level() == lvl {
            out.push(id);
        } else {
            for &child in cell.children() {
                self.walk_recv(child, lvl, out);
            }
        }
    }

    fn emitted_count(&self, link: usize, lvl: u8) -> usize {
        let mut count = 0;
        for entry in self.links[link].send.clone() {
            self.walk_send(entry.cell, entry.direction, lvl, &mut |_| count += 1);
        }
        count
    }

    fn recv_cells(&self, link: usize, lvl: u8) -> Vec<CellId> {
        let mut cells = Vec::new();
        for root in self.links[link].recv.clone() {
            self.walk_recv(root, lvl, &mut cells);
        }
        cells
    }

    /// Generic cell-payload exchange: pack `width` scalars per emitted cell,
    /// send to every neighbor, then fill the local ghosts in key order.
    fn exchange_cell_payload(
        &mut self,
        communicator: &dyn Communicator,
        kind: u64,
        lvl: u8,
        width: usize,
        ctx: &mut RuntimeContext,
        pack: &dyn Fn(&Cell, &mut Vec<f64>),
        unpack: &mut dyn FnMut(&mut AmrMesh, CellId, &mut std::vec::IntoIter<f64>),
    ) -> Result<(), MeshError> {
        let message_tag = tag_for(kind, lvl);

        for link in 0..self.links.len() {
            let mut buffer = Vec::new();
            for entry in self.links[link].send.clone() {
                self.walk_send(entry.cell, entry.direction, lvl, &mut |cell| {
                    pack(cell, &mut buffer)
                });
            }
            communicator.send(
                self.links[link].rank,
                frame(ctx.rank(), message_tag, &encode_f64s(&buffer)),
            );
        }

        for link in 0..self.links.len() {
            let peer = self.links[link].rank;
            let payload = recv_matching(communicator, peer, message_tag)?;
            let values = decode_f64s(&payload)?;
            let ghosts = self.recv_cells(link, lvl);

            if values.len() != ghosts.len() * width {
                let error = MeshError::Exchange(format!(
                    "rank {peer} sent {} values at level {lvl}, expected {} for {} ghosts",
                    values.len(),
                    ghosts.len() * width,
                    ghosts.len()
                ));
                ctx.record(error.clone());
                return Err(error);
            }
            if let Some(&expected) = self.links[link].recv_counts.get(lvl as usize) {
                if expected != ghosts.len() {
                    let error = MeshError::Exchange(format!(
                        "ghost count {} at level {lvl} disagrees with exchanged count {expected}",
                        ghosts.len()
                    ));
                    ctx.record(error.clone());
                    return Err(error);
                }
            }

            let mut iter = values.into_iter();
            for ghost in ghosts {
                unpack(self, ghost, &mut iter);
            }
        }
        Ok(())
    }

    /// Exchange the full primitive state of one level's ghost layer.
    pub fn exchange_primitives(
        &mut self,
        communicator: &dyn Communicator,
        lvl: u8,
        set: PrimSet,
        model: &dyn Model,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        let width = CellState::transmitted(self.config().phases, self.config().transports);
        self.exchange_cell_payload(
            communicator,
            tag::PRIMITIVES,
            lvl,
            width,
            ctx,
            &move |cell, buffer| cell.state(set).fill_buffer(buffer),
            &mut |mesh, ghost, values| {
                let cell = mesh.cell_mut(ghost);
                cell.state_mut(set).read_buffer(values);
                let state = cell.state_mut(set);
                model.fulfill_state(&mut state.phases, &mut state.mixture);
            },
        )
    }

    /// Exchange the refinement indicator of one level.
    pub fn exchange_xi(
        &mut self,
        communicator: &dyn Communicator,
        lvl: u8,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        self.exchange_cell_payload(
            communicator,
            tag::XI,
            lvl,
            1,
            ctx,
            &|cell, buffer| buffer.push(cell.xi()),
            &mut |mesh, ghost, values| {
                mesh.cell_mut(ghost).set_xi(values.next().unwrap_or_default());
            },
        )
    }

    /// Exchange transported scalars of one level.
    pub fn exchange_transports(
        &mut self,
        communicator: &dyn Communicator,
        lvl: u8,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        let width = self.config().transports;
        if width == 0 {
            return Ok(());
        }
        self.exchange_cell_payload(
            communicator,
            tag::TRANSPORTS,
            lvl,
            width,
            ctx,
            &|cell, buffer| {
                for transport in cell.transports() {
                    buffer.push(transport.0);
                }
            },
            &mut |mesh, ghost, values| {
                let cell = mesh.cell_mut(ghost);
                for transport in cell.state_mut(PrimSet::Natural).transports.iter_mut() {
                    transport.0 = values.next().unwrap_or_default();
                }
            },
        )
    }

    /// Exchange one vector quantity per cell (dimensionality-tight), used by
    /// additional-physics packages for their gradients.
    pub fn exchange_vector(
        &mut self,
        communicator: &dyn Communicator,
        lvl: u8,
        ctx: &mut RuntimeContext,
        get: &dyn Fn(&Cell) -> Coord,
        set: &mut dyn FnMut(&mut Cell, Coord),
    ) -> Result<(), MeshError> {
        let dim = self.dim();
        self.exchange_cell_payload(
            communicator,
            tag::VECTOR,
            lvl,
            dim,
            ctx,
            &move |cell, buffer| {
                let vector = get(cell);
                for axis in 0..dim {
                    buffer.push(vector.component(axis));
                }
            },
            &mut |mesh, ghost, values| {
                let mut vector = Coord::ZERO;
                for axis in 0..dim {
                    *vector.component_mut(axis) = values.next().unwrap_or_default();
                }
                set(mesh.cell_mut(ghost), vector);
            },
        )
    }

    /// Exchange the split flags of one level, bit-packed. The receive side
    /// only stores them; `refresh_ghosts` reacts afterwards.
    pub fn exchange_split(
        &mut self,
        communicator: &dyn Communicator,
        lvl: u8,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        let message_tag = tag_for(tag::SPLIT, lvl);

        for link in 0..self.links.len() {
            let mut bits: BitVec<u8, Lsb0> = BitVec::new();
            for entry in self.links[link].send.clone() {
                self.walk_send(entry.cell, entry.direction, lvl, &mut |cell| {
                    bits.push(cell.split())
                });
            }
            communicator.send(
                self.links[link].rank,
                frame(ctx.rank(), message_tag, &bits.into_vec()),
            );
        }

        for link in 0..self.links.len() {
            let peer = self.links[link].rank;
            let payload = recv_matching(communicator, peer, message_tag)?;
            let bits: BitVec<u8, Lsb0> = BitVec::from_vec(payload);
            let ghosts = self.recv_cells(link, lvl);

            if bits.len() < ghosts.len() {
                let error = MeshError::Exchange(format!(
                    "rank {peer} sent {} split flags at level {lvl}, expected {}",
                    bits.len(),
                    ghosts.len()
                ));
                ctx.record(error.clone());
                return Err(error);
            }

            for (ghost, split) in ghosts.into_iter().zip(bits.iter().by_vals()) {
                self.cell_mut(ghost).set_split_flag(split);
            }
        }
        Ok(())
    }

    /// Exchange the per-link element counts of one level, sizing the next
    /// level's buffers on both sides.
    pub fn exchange_level_counts(
        &mut self,
        communicator: &dyn Communicator,
        lvl: u8,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        let message_tag = tag_for(tag::COUNTS, lvl);

        for link in 0..self.links.len() {
            let count = self.emitted_count(link, lvl);
            let counts = &mut self.links[link].send_counts;
            if counts.len() <= lvl as usize {
                counts.resize(lvl as usize + 1, 0);
            }
            counts[lvl as usize] = count;
            communicator.send(
                self.links[link].rank,
                frame(ctx.rank(), message_tag, &(count as u64).to_le_bytes()),
            );
        }

        for link in 0..self.links.len() {
            let peer = self.links[link].rank;
            let payload = recv_matching(communicator, peer, message_tag)?;
            if payload.len() != 8 {
                let error =
                    MeshError::Exchange(format!("malformed count payload from rank {peer}"));
                ctx.record(error.clone());
                return Err(error);
            }
            let count = u64::from_le_bytes(payload[..8].try_into().expect("8 bytes")) as usize;
            let counts = &mut self.links[link].recv_counts;
            if counts.len() <= lvl as usize {
                counts.resize(lvl as usize + 1, 0);
            }
            counts[lvl as usize] = count;
        }
        Ok(())
    }
}

/// Reduce the admissible time step across all ranks.
pub fn reduce_time_step(
    communicator: &dyn Communicator,
    local_dt: f64,
) -> Result<f64, MeshError> {
    comm::all_reduce_f64(communicator, tag_for(tag::TIME_STEP, 0), local_dt, f64::min)
}

/// Collective error verdict at a barrier: if any rank recorded a fatal
/// error, every rank fails.
pub fn verify_collective(
    communicator: &dyn Communicator,
    ctx: &RuntimeContext,
) -> Result<(), MeshError> {
    let local = ctx.errors().len() as f64;
    let total = comm::all_reduce_f64(
        communicator,
        tag_for(tag::VERDICT, 0),
        local,
        |a, b| a + b,
    )?;
    if total > 0.0 {
        return Err(match ctx.errors().first() {
            Some(error) => error.clone(),
            None => MeshError::Exchange("a peer rank reported a fatal error".into()),
        });
    }
    Ok(())
}
