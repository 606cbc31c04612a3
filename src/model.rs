//! Physical state containers and the trait contracts through which the
//! external model and additional-physics packages plug into the core.
//!
//! The core owns the *layout* of a cell's state (phases, mixture,
//! transports, conservative accumulator) so it can copy, average, pack and
//! unpack it; everything that gives those numbers meaning — equations of
//! state, Riemann solutions, relaxation procedures — lives behind [`Model`]
//! and [`AddPhys`].

use crate::error::MeshError;
use crate::geometry::{Coord, FaceGeometry};
use serde::{Deserialize, Serialize};

/// Primitive state of one phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Volume fraction α.
    pub alpha: f64,
    pub density: f64,
    pub pressure: f64,
}

impl Phase {
    /// Number of scalars carried across ranks per phase.
    pub const TRANSMITTED: usize = 3;

    pub fn fill_buffer(&self, buffer: &mut Vec<f64>) {
        buffer.push(self.alpha);
        buffer.push(self.density);
        buffer.push(self.pressure);
    }

    pub fn read_buffer<I: Iterator<Item = f64>>(&mut self, values: &mut I) {
        self.alpha = values.next().unwrap_or_default();
        self.density = values.next().unwrap_or_default();
        self.pressure = values.next().unwrap_or_default();
    }

    pub fn is_finite(&self) -> bool {
        self.alpha.is_finite() && self.density.is_finite() && self.pressure.is_finite()
    }
}

/// Primitive state of the mixture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Mixture {
    pub density: f64,
    pub pressure: f64,
    pub velocity: Coord,
    /// Specific total energy.
    pub energy: f64,
    /// Mixture sound speed; derived, rebuilt by `Model::fulfill_state`.
    pub sound_speed: f64,
}

impl Mixture {
    /// Number of scalars carried across ranks (the sound speed is derived
    /// and rebuilt on the receiving side).
    pub const TRANSMITTED: usize = 6;

    pub fn fill_buffer(&self, buffer: &mut Vec<f64>) {
        buffer.push(self.density);
        buffer.push(self.pressure);
        buffer.push(self.velocity.x);
        buffer.push(self.velocity.y);
        buffer.push(self.velocity.z);
        buffer.push(self.energy);
    }

    pub fn read_buffer<I: Iterator<Item = f64>>(&mut self, values: &mut I) {
        self.density = values.next().unwrap_or_default();
        self.pressure = values.next().unwrap_or_default();
        self.velocity.x = values.next().unwrap_or_default();
        self.velocity.y = values.next().unwrap_or_default();
        self.velocity.z = values.next().unwrap_or_default();
        self.energy = values.next().unwrap_or_default();
    }

    pub fn is_finite(&self) -> bool {
        self.density.is_finite()
            && self.pressure.is_finite()
            && self.velocity.is_finite()
            && self.energy.is_finite()
    }
}

/// A passively advected scalar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transport(pub f64);

/// Conservative accumulator: masses and volume fractions per phase plus
/// mixture momentum and energy, per unit volume. Used both as the running
/// flux sum during a hyperbolic step and as the averaging buffer when
/// coarsening.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Flux {
    pub alphas: Vec<f64>,
    pub masses: Vec<f64>,
    pub momentum: Coord,
    pub energy: f64,
}

impl Flux {
    pub fn new(phases: usize) -> Self {
        Self {
            alphas: vec![0.0; phases],
            masses: vec![0.0; phases],
            momentum: Coord::ZERO,
            energy: 0.0,
        }
    }

    pub fn set_to_zero(&mut self) {
        self.alphas.fill(0.0);
        self.masses.fill(0.0);
        self.momentum = Coord::ZERO;
        self.energy = 0.0;
    }

    pub fn add_scaled(&mut self, other: &Flux, scale: f64) {
        for (a, b) in self.alphas.iter_mut().zip(other.alphas.iter()) {
            *a += scale * b;
        }
        for (a, b) in self.masses.iter_mut().zip(other.masses.iter()) {
            *a += scale * b;
        }
        self.momentum += other.momentum * scale;
        self.energy += scale * other.energy;
    }

    pub fn multiply(&mut self, scale: f64) {
        for a in self.alphas.iter_mut() {
            *a *= scale;
        }
        for m in self.masses.iter_mut() {
            *m *= scale;
        }
        self.momentum = self.momentum * scale;
        self.energy *= scale;
    }
}

/// Cell-centered scalar selectable for gradients and output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarVar {
    Density,
    Pressure,
    VelocityU,
    VelocityV,
    VelocityW,
    Alpha(usize),
    Transport(usize),
    Xi,
}

impl ScalarVar {
    /// Velocity components get one-sided treatment at walls and symmetry
    /// planes; everything else contributes only to gradient denominators
    /// there.
    pub fn velocity_axis(&self) -> Option<usize> {
        match self {
            ScalarVar::VelocityU => Some(0),
            ScalarVar::VelocityV => Some(1),
            ScalarVar::VelocityW => Some(2),
            _ => None,
        }
    }
}

/// A borrowed view of one cell's primitive state, as handed to the model.
#[derive(Clone, Copy)]
pub struct StateRef<'a> {
    pub phases: &'a [Phase],
    pub mixture: &'a Mixture,
    pub transports: &'a [Transport],
}

/// Kind of a cell interface. `Internal` faces have a cell on both sides;
/// every other kind closes the domain and takes its flux from the one-sided
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundaryKind {
    Internal,
    Absorption,
    Wall,
    Symmetry,
    Inflow,
    Outflow,
}

/// The fixed capability set the core needs from the physical model.
pub trait Model {
    /// Rebuild derived quantities (mixture density, energy, sound speed, …)
    /// from the transported primitives.
    fn fulfill_state(&self, phases: &mut [Phase], mixture: &mut Mixture);

    /// Build the conservative state from primitives.
    fn build_cons(&self, phases: &[Phase], mixture: &Mixture, cons: &mut Flux);

    /// Rebuild primitives from a conservative state. Fails with
    /// [`MeshError::Numeric`] on non-finite or unphysical results.
    fn build_prim(
        &self,
        cons: &Flux,
        phases: &mut [Phase],
        mixture: &mut Mixture,
    ) -> Result<(), MeshError>;

    /// Relaxation procedures toward (pressure, temperature, …) equilibria.
    fn relaxations(&self, _phases: &mut [Phase], _mixture: &mut Mixture) {}

    /// Riemann flux through a face. `right` is `None` for boundary faces;
    /// the boundary kind selects the one-sided state construction.
    fn face_flux(
        &self,
        left: StateRef,
        right: Option<StateRef>,
        kind: BoundaryKind,
        face: &FaceGeometry,
    ) -> Flux;

    /// Geometric source terms added by symmetry corrections. No-op in plane
    /// geometry.
    fn symmetric_terms(&self, _state: StateRef, _position: &Coord, _cons: &mut Flux) {}

    /// Scheme-specific correction applied after the conservative update.
    fn scheme_correction(&self, _phases: &[Phase], _mixture: &Mixture, _cons: &mut Flux) {}
}

/// Opaque per-cell storage for an additional-physics package (gradients of
/// whatever quantities the package needs).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuantitiesAddPhys {
    pub gradients: Vec<Coord>,
}

/// Contract for additional physics (surface tension, viscosity, …). All
/// methods default to no-ops so packages implement only what they use.
pub trait AddPhys {
    /// Attach this package's per-cell storage when a cell is allocated.
    fn add_quantity(&self, quantities: &mut Vec<QuantitiesAddPhys>) {
        quantities.push(QuantitiesAddPhys::default());
    }

    /// Fill the per-cell quantities from the current primitive state.
    fn compute_quantities(&self, _state: StateRef, _quantities: &mut [QuantitiesAddPhys]) {}

    /// Additional flux through an internal face.
    fn compute_flux_add_phys(
        &self,
        _left: StateRef,
        _right: StateRef,
        _face: &FaceGeometry,
        _cons: &mut Flux,
    ) {
    }

    /// Non-conservative volume contribution.
    fn add_non_cons(&self, _state: StateRef, _cons: &mut Flux) {}

    fn reinitialization_activated(&self) -> bool {
        false
    }

    /// Rebuild a color function transport from the volume fractions.
    fn reinitialize_color_function(&self, _transports: &mut [Transport], _phases: &[Phase]) {}

    /// Hook for package-specific ghost communication at a given level.
    fn communications_add_phys(&mut self, _dim: usize, _level: u8) {}
}
