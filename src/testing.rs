//! Shared fixtures for unit tests: a minimal ideal-gas model and mesh
//! construction helpers.

use crate::error::{MeshError, RuntimeContext};
use crate::geometry::{Coord, FaceGeometry};
use crate::mesh::{AmrMesh, BoundaryKind, MeshConfig};
use crate::model::{Flux, Mixture, Model, Phase, StateRef};

/// Single-EOS multiphase ideal gas: enough physics for the topology and
/// exchange machinery to be exercised with exactly invertible states.
pub struct IdealGas {
    pub gamma: f64,
}

impl IdealGas {
    /// γ = 2 keeps `build_prim ∘ build_cons` exact on the simple states the
    /// tests assert against.
    pub fn new() -> Self {
        Self { gamma: 2.0 }
    }

    fn energy(&self, density: f64, pressure: f64, velocity: Coord) -> f64 {
        pressure / ((self.gamma - 1.0) * density) + 0.5 * velocity.norm().powi(2)
    }

    fn normal_flux(&self, state: StateRef, face: &FaceGeometry) -> Flux {
        let mixture = state.mixture;
        let un = mixture.velocity.x * face.normal.x
            + mixture.velocity.y * face.normal.y
            + mixture.velocity.z * face.normal.z;
        let mut flux = Flux::new(state.phases.len());
        for (k, phase) in state.phases.iter().enumerate() {
            flux.alphas[k] = phase.alpha * un;
            flux.masses[k] = phase.alpha * phase.density * un;
        }
        flux.momentum =
            mixture.velocity * (mixture.density * un) + face.normal * mixture.pressure;
        flux.energy = (mixture.density * mixture.energy + mixture.pressure) * un;
        flux
    }
}

impl Model for IdealGas {
    fn fulfill_state(&self, phases: &mut [Phase], mixture: &mut Mixture) {
        let density: f64 = phases.iter().map(|p| p.alpha * p.density).sum();
        mixture.density = density;
        if density > 0.0 {
            mixture.energy = self.energy(density, mixture.pressure, mixture.velocity);
            mixture.sound_speed = (self.gamma * mixture.pressure / density).max(0.0).sqrt();
        } else {
            mixture.energy = 0.0;
            mixture.sound_speed = 0.0;
        }
    }

    fn build_cons(&self, phases: &[Phase], mixture: &Mixture, cons: &mut Flux) {
        cons.set_to_zero();
        let mut density = 0.0;
        for (k, phase) in phases.iter().enumerate() {
            cons.alphas[k] = phase.alpha;
            cons.masses[k] = phase.alpha * phase.density;
            density += phase.alpha * phase.density;
        }
        cons.momentum = mixture.velocity * density;
        cons.energy = density * self.energy(density, mixture.pressure, mixture.velocity);
    }

    fn build_prim(
        &self,
        cons: &Flux,
        phases: &mut [Phase],
        mixture: &mut Mixture,
    ) -> Result<(), MeshError> {
        let density: f64 = cons.masses.iter().sum();
        if !(density > 0.0) {
            return Err(MeshError::Numeric(format!(
                "non-positive mixture density {density}"
            )));
        }
        let velocity = cons.momentum * (1.0 / density);
        let energy = cons.energy / density;
        let pressure =
            (self.gamma - 1.0) * density * (energy - 0.5 * velocity.norm().powi(2));

        for (k, phase) in phases.iter_mut().enumerate() {
            phase.alpha = cons.alphas[k];
            phase.density = if cons.alphas[k] > 1e-12 {
                cons.masses[k] / cons.alphas[k]
            } else {
                0.0
            };
            phase.pressure = pressure;
        }
        mixture.density = density;
        mixture.velocity = velocity;
        mixture.energy = energy;
        mixture.pressure = pressure;
        mixture.sound_speed = (self.gamma * pressure / density).max(0.0).sqrt();

        if !pressure.is_finite() || !velocity.is_finite() {
            return Err(MeshError::Numeric(format!(
                "non-finite primitives: p = {pressure}"
            )));
        }
        Ok(())
    }

    fn face_flux(
        &self,
        left: StateRef,
        right: Option<StateRef>,
        kind: BoundaryKind,
        face: &FaceGeometry,
    ) -> Flux {
        match (kind, right) {
            (BoundaryKind::Internal, Some(right)) => {
                // Rusanov.
                let mut flux = self.normal_flux(left, face);
                flux.add_scaled(&self.normal_flux(right, face), 1.0);
                flux.multiply(0.5);
                let speed = (left.mixture.velocity.norm() + left.mixture.sound_speed)
                    .max(right.mixture.velocity.norm() + right.mixture.sound_speed);
                let mut jump = Flux::new(left.phases.len());
                self.build_cons(right.phases, right.mixture, &mut jump);
                let mut left_cons = Flux::new(left.phases.len());
                self.build_cons(left.phases, left.mixture, &mut left_cons);
                jump.add_scaled(&left_cons, -1.0);
                flux.add_scaled(&jump, -0.5 * speed);
                flux
            }
            (BoundaryKind::Wall | BoundaryKind::Symmetry, _) => {
                // Pressure only.
                let mut flux = Flux::new(left.phases.len());
                flux.momentum = face.normal * left.mixture.pressure;
                flux
            }
            _ => self.normal_flux(left, face),
        }
    }
}

/// Build a serial mesh plus its context.
pub fn serial_mesh(config: MeshConfig) -> (AmrMesh, RuntimeContext) {
    let ctx = RuntimeContext::serial();
    let mesh = AmrMesh::new(config, &[], &ctx).expect("valid test configuration");
    (mesh, ctx)
}

/// Impose a uniform state on every interior and ghost cell, then fulfill.
pub fn fill_uniform(mesh: &mut AmrMesh, model: &IdealGas, density: f64, pressure: f64) {
    fill_by_position(mesh, model, |_| (density, pressure));
}

/// Impose a position-dependent `(density, pressure)` on every cell at every
/// level, ghosts included.
pub fn fill_by_position(
    mesh: &mut AmrMesh,
    model: &IdealGas,
    state: impl Fn(Coord) -> (f64, f64),
) {
    for lvl in 0..=mesh.lvl_max() {
        let ids: Vec<_> = mesh
            .cells_at(lvl)
            .iter()
            .chain(mesh.ghosts_at(lvl).iter())
            .copied()
            .collect();
        for id in ids {
            let position = mesh.cell(id).position();
            let (density, pressure) = state(position);
            let cell = mesh.cell_mut(id);
            for phase in cell.state_mut(crate::mesh::PrimSet::Natural).phases.iter_mut() {
                phase.alpha = 1.0;
                phase.density = density;
                phase.pressure = pressure;
            }
            let state = cell.state_mut(crate::mesh::PrimSet::Natural);
            state.mixture.pressure = pressure;
            state.mixture.velocity = Coord::ZERO;
            model.fulfill_state(&mut state.phases, &mut state.mixture);
        }
    }
}
