//! Topological and data-movement substrate for a compressible multiphase
//! finite-volume solver on a block-structured adaptive Cartesian grid.
//!
//! The crate owns the hierarchical cell tree, the Morton-key domain
//! decomposition, cell-to-cell interfaces across refinement levels, the
//! refine/coarsen protocol under the 2:1 neighbor-level constraint, and the
//! ghost-cell exchange that keeps per-rank subdomains consistent. Physics
//! (equations of state, Riemann solvers, relaxations) enters only through
//! the [`model::Model`] and [`model::AddPhys`] traits; time-stepping policy
//! stays with the outer driver, which sequences the per-level primitives
//! exposed by [`mesh::AmrMesh`].

pub mod decomposition;
pub mod error;
pub mod geometry;
pub mod key;
pub mod mesh;
pub mod model;
pub mod parallel;

/// Common types for driver code.
pub mod prelude {
    pub use crate::decomposition::Decomposition;
    pub use crate::error::{MeshError, RuntimeContext};
    pub use crate::geometry::{Coord, Direction};
    pub use crate::key::Key;
    pub use crate::mesh::{
        AdaptCriteria, AmrMesh, BoundaryKind, MeshConfig, SchemeOrder, StretchZone,
    };
    pub use crate::model::{AddPhys, Flux, Mixture, Model, Phase, ScalarVar, Transport};
    pub use crate::parallel::comm::{mem_communicators, Communicator, MemCommunicator};
}

#[cfg(test)]
pub(crate) mod testing;
