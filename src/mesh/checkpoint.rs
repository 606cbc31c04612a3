//! Saving and restoring the mesh, and exporting its leaves.
//!
//! A checkpoint is the depth-first, key-ordered `(key, level, split)`
//! topology of the rank's tree plus the primitive state of each leaf.
//! Restoring replays the split map through the regular refinement
//! machinery, so a resumed mesh is bit-identical in structure to the saved
//! one. Output is VTK unstructured data over leaves only.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vtkio::model::*;

use crate::error::{MeshError, RuntimeContext};
use crate::key::Key;
use crate::model::{AddPhys, Model, ScalarVar};
use crate::parallel::comm::Communicator;

use super::cell::{CellId, CellState, PrimSet};
use super::AmrMesh;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("malformed checkpoint: {0}")]
    Parse(String),
}

/// One node of the saved tree, in depth-first key order.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub key: Key,
    pub level: u8,
    pub split: bool,
}

/// Primitive state of one leaf, in the same traversal order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafRecord {
    pub state: CellState,
    pub xi: f64,
}

/// A rank-local snapshot of the tree and its leaf state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub topology: Vec<TreeRecord>,
    pub leaves: Vec<LeafRecord>,
}

impl Checkpoint {
    pub fn to_ron(&self) -> Result<String, CheckpointError> {
        ron::ser::to_string(self).map_err(|e| CheckpointError::Serialize(e.to_string()))
    }

    pub fn from_ron(text: &str) -> Result<Self, CheckpointError> {
        ron::de::from_str(text).map_err(|e| CheckpointError::Parse(e.to_string()))
    }
}

impl AmrMesh {
    /// Snapshot this rank's tree topology and leaf state.
    pub fn checkpoint(&self) -> Checkpoint {
        let mut snapshot = Checkpoint::default();
        for &root in self.cells_at(0) {
            self.checkpoint_cell(root, &mut snapshot);
        }
        snapshot
    }

    fn checkpoint_cell(&self, id: CellId, snapshot: &mut Checkpoint) {
        let cell = self.cell(id);
        snapshot.topology.push(TreeRecord {
            key: cell.key(),
            level: cell.level(),
            split: cell.split(),
        });
        if cell.split() {
            for &child in cell.children() {
                self.checkpoint_cell(child, snapshot);
            }
        } else {
            snapshot.leaves.push(LeafRecord {
                state: cell.state.clone(),
                xi: cell.xi(),
            });
        }
    }

    /// Rebuild the saved refinement state on a freshly constructed mesh of
    /// the same configuration, then load the leaf primitives. Every rank
    /// restores its own snapshot; the ghost layers are rebuilt through the
    /// usual split-flag exchange, level by level.
    pub fn restore(
        &mut self,
        snapshot: &Checkpoint,
        model: &dyn Model,
        add_phys: &[Box<dyn AddPhys>],
        comm: &dyn Communicator,
        ctx: &mut RuntimeContext,
    ) -> Result<(), MeshError> {
        let split_map: HashMap<Key, bool> = snapshot
            .topology
            .iter()
            .map(|record| (record.key, record.split))
            .collect();

        for lvl in 0..self.config.lvl_max {
            for id in self.cells_lvl[lvl as usize].clone() {
                let cell = self.cell(id);
                let wanted = split_map.get(&cell.key()).copied().unwrap_or(false);
                if wanted && !cell.split() {
                    self.refine_cell(id, add_phys);
                }
            }
            if comm.size() > 1 {
                self.exchange_split(comm, lvl, ctx)?;
            }
            self.refresh_ghosts(lvl, model, add_phys);
            if comm.size() > 1 {
                self.exchange_level_counts(comm, lvl + 1, ctx)?;
            }
            self.rebuild_level_arrays(lvl);
        }

        let mut cursor = 0;
        for root in self.cells_at(0).to_vec() {
            self.restore_cell(root, snapshot, &mut cursor, model)?;
        }
        if cursor != snapshot.leaves.len() {
            return Err(MeshError::Topology(format!(
                "checkpoint holds {} leaves, restored tree has {cursor}",
                snapshot.leaves.len()
            )));
        }

        if comm.size() > 1 {
            for lvl in 0..=self.config.lvl_max {
                self.exchange_primitives(comm, lvl, PrimSet::Natural, model, ctx)?;
            }
        }
        Ok(())
    }

    fn restore_cell(
        &mut self,
        id: CellId,
        snapshot: &Checkpoint,
        cursor: &mut usize,
        model: &dyn Model,
    ) -> Result<(), MeshError> {
        if self.cell(id).split() {
            for child in self.cell(id).children().to_vec() {
                self.restore_cell(child, snapshot, cursor, model)?;
            }
            return Ok(());
        }
        let record = snapshot.leaves.get(*cursor).ok_or_else(|| {
            MeshError::Topology("checkpoint ran out of leaf records".into())
        })?;
        *cursor += 1;
        let cell = self.cell_mut(id);
        cell.state = record.state.clone();
        cell.set_xi(record.xi);
        model.fulfill_state(&mut cell.state.phases, &mut cell.state.mixture);
        Ok(())
    }

    // *******************************
    // VTK output

    /// Build the VTK model of the current leaves: 4 points per cell in 1D
    /// and 2D, 8 in 3D, traversed level by level, with per-cell scalar
    /// attributes.
    pub fn vtk_model(&self, title: &str) -> Vtk {
        let leaves = self.leaves();
        let points_per_cell: usize = if self.dim() == 3 { 8 } else { 4 };

        let mut vertices = Vec::with_capacity(leaves.len() * points_per_cell * 3);
        let mut connectivity = Vec::with_capacity(leaves.len() * points_per_cell);
        let mut offsets = Vec::with_capacity(leaves.len());

        for (index, &id) in leaves.iter().enumerate() {
            let cell = self.cell(id);
            let center = cell.position();
            let half = cell.size() * 0.5;

            // Bottom quad, counter-clockwise.
            let corners_2d = [
                (-half.x, -half.y),
                (half.x, -half.y),
                (half.x, half.y),
                (-half.x, half.y),
            ];
            if self.dim() == 3 {
                for dz in [-half.z, half.z] {
                    for (dx, dy) in corners_2d {
                        vertices.push(center.x + dx);
                        vertices.push(center.y + dy);
                        vertices.push(center.z + dz);
                    }
                }
            } else {
                for (dx, dy) in corners_2d {
                    vertices.push(center.x + dx);
                    vertices.push(center.y + dy);
                    vertices.push(center.z);
                }
            }

            for point in 0..points_per_cell {
                connectivity.push((index * points_per_cell + point) as u64);
            }
            offsets.push(((index + 1) * points_per_cell) as u64);
        }

        let cell_type = if self.dim() == 3 {
            CellType::Hexahedron
        } else {
            CellType::Quad
        };

        let mut attributes = Attributes {
            point: Vec::new(),
            cell: Vec::new(),
        };

        let mut push_scalar = |name: String, data: Vec<f64>| {
            attributes.cell.push(Attribute::DataArray(DataArrayBase {
                name,
                elem: ElementType::Scalars {
                    num_comp: 1,
                    lookup_table: None,
                },
                data: IOBuffer::new(data),
            }));
        };

        for phase in 0..self.config().phases {
            push_scalar(
                format!("phase{phase}::alpha"),
                leaves
                    .iter()
                    .map(|&id| self.cell(id).scalar(ScalarVar::Alpha(phase)))
                    .collect(),
            );
            push_scalar(
                format!("phase{phase}::density"),
                leaves
                    .iter()
                    .map(|&id| self.cell(id).phases()[phase].density)
                    .collect(),
            );
            push_scalar(
                format!("phase{phase}::pressure"),
                leaves
                    .iter()
                    .map(|&id| self.cell(id).phases()[phase].pressure)
                    .collect(),
            );
        }
        for (name, var) in [
            ("mixture::density", ScalarVar::Density),
            ("mixture::pressure", ScalarVar::Pressure),
            ("mixture::u", ScalarVar::VelocityU),
            ("mixture::v", ScalarVar::VelocityV),
            ("mixture::w", ScalarVar::VelocityW),
            ("xi", ScalarVar::Xi),
        ] {
            push_scalar(
                name.to_string(),
                leaves.iter().map(|&id| self.cell(id).scalar(var)).collect(),
            );
        }
        for transport in 0..self.config().transports {
            push_scalar(
                format!("transport{transport}"),
                leaves
                    .iter()
                    .map(|&id| self.cell(id).scalar(ScalarVar::Transport(transport)))
                    .collect(),
            );
        }
        push_scalar(
            "level".to_string(),
            leaves
                .iter()
                .map(|&id| self.cell(id).level() as f64)
                .collect(),
        );

        let piece = UnstructuredGridPiece {
            points: IOBuffer::new(vertices),
            cells: Cells {
                cell_verts: VertexNumbers::XML {
                    connectivity,
                    offsets,
                },
                types: vec![cell_type; leaves.len()],
            },
            data: attributes,
        };

        Vtk {
            version: (2, 2).into(),
            title: title.to_string(),
            byte_order: ByteOrder::LittleEndian,
            data: DataSet::UnstructuredGrid {
                meta: None,
                pieces: vec![Piece::Inline(Box::new(piece))],
            },
            file_path: None,
        }
    }

    pub fn export_vtu(&self, title: &str, path: impl AsRef<Path>) -> Result<(), io::Error> {
        self.vtk_model(title).export(path).map_err(|e| match e {
            vtkio::Error::IO(io) => io,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshConfig;
    use crate::parallel::comm::mem_communicators;
    use crate::testing::{fill_by_position, serial_mesh, IdealGas};

    fn refined_mesh() -> (super::super::AmrMesh, RuntimeContext, IdealGas) {
        let config = MeshConfig {
            lvl_max: 1,
            criteria: crate::mesh::AdaptCriteria {
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
        let comm = mem_communicators(1).pop().unwrap();
        mesh.adapt_level(0, &model, &[], &comm, &mut ctx).unwrap();
        (mesh, ctx, model)
    }

    #[test]
    fn checkpoint_restores_topology_and_state() {
        let (mesh, _ctx, model) = refined_mesh();
        let snapshot = mesh.checkpoint();
        assert_eq!(snapshot.leaves.len(), mesh.leaves().len());
        // Depth-first key order: a split record is followed by its
        // children.
        assert!(snapshot.topology.windows(2).all(|w| w[0].key < w[1].key));

        let (mut restored, mut ctx) = serial_mesh(mesh.config().clone());
        let comm = mem_communicators(1).pop().unwrap();
        restored
            .restore(&snapshot, &model, &[], &comm, &mut ctx)
            .unwrap();
        restored.validate_topology().unwrap();

        let original: Vec<_> = mesh
            .leaves()
            .iter()
            .map(|&id| (mesh.cell(id).key(), mesh.cell(id).mixture().density))
            .collect();
        let replayed: Vec<_> = restored
            .leaves()
            .iter()
            .map(|&id| (restored.cell(id).key(), restored.cell(id).mixture().density))
            .collect();
        assert_eq!(original, replayed);
    }

    #[test]
    fn checkpoint_ron_round_trip() {
        let (mesh, _ctx, _model) = refined_mesh();
        let snapshot = mesh.checkpoint();
        let text = snapshot.to_ron().unwrap();
        let decoded = Checkpoint::from_ron(&text).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn vtk_emits_leaves_with_per_cell_counters() {
        let (mesh, _ctx, _model) = refined_mesh();
        let leaves = mesh.leaves().len();
        let vtk = mesh.vtk_model("leaves");

        let DataSet::UnstructuredGrid { pieces, .. } = vtk.data else {
            panic!("expected unstructured output");
        };
        let Piece::Inline(piece) = &pieces[0] else {
            panic!("expected inline piece");
        };
        let VertexNumbers::XML {
            connectivity,
            offsets,
        } = &piece.cells.cell_verts
        else {
            panic!("expected xml vertex numbers");
        };
        assert_eq!(offsets.len(), leaves);
        assert_eq!(connectivity.len(), leaves * 4);
        assert_eq!(*offsets.last().unwrap(), (leaves * 4) as u64);
        assert_eq!(piece.cells.types.len(), leaves);
    }
}
