//! Per-axis coordinate mapping of the base grid: cell widths and centers,
//! uniform or stretched.

use crate::error::MeshError;
use serde::{Deserialize, Serialize};

/// A stretched sub-interval of one axis: `cells` cells whose widths grow by
/// `factor` from one cell to the next, filling `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StretchZone {
    pub start: f64,
    pub end: f64,
    pub factor: f64,
    pub cells: i64,
}

/// Widths and center positions of the base cells along one axis.
#[derive(Clone, Debug, Default)]
pub(crate) struct AxisSpacing {
    pub widths: Vec<f64>,
    pub positions: Vec<f64>,
}

impl AxisSpacing {
    pub fn build(length: f64, count: i64, zones: &[StretchZone]) -> Result<Self, MeshError> {
        if length <= 0.0 {
            return Err(MeshError::Config(format!(
                "axis length must be positive, got {length}"
            )));
        }
        if zones.is_empty() {
            return Ok(Self::uniform(length, count));
        }
        Self::stretched(length, count, zones)
    }

    fn uniform(length: f64, count: i64) -> Self {
        let width = length / count as f64;
        let widths = vec![width; count as usize];
        let positions = (0..count).map(|i| (i as f64 + 0.5) * width).collect();
        Self { widths, positions }
    }

    fn stretched(length: f64, count: i64, zones: &[StretchZone]) -> Result<Self, MeshError> {
        let total: i64 = zones.iter().map(|z| z.cells).sum();
        if total != count {
            return Err(MeshError::Config(format!(
                "stretch zones cover {total} cells, axis has {count}"
            )));
        }

        let mut widths = Vec::with_capacity(count as usize);
        let mut cursor = 0.0;

        for zone in zones {
            if (zone.start - cursor).abs() > 1e-12 * length {
                return Err(MeshError::Config(format!(
                    "stretch zone starts at {} but previous zone ended at {cursor}",
                    zone.start
                )));
            }
            if zone.cells < 1 || zone.factor <= 0.0 {
                return Err(MeshError::Config(
                    "stretch zone needs at least one cell and a positive factor".into(),
                ));
            }

            let extent = zone.end - zone.start;
            let n = zone.cells as f64;
            // First width of the geometric progression filling the zone.
            let first = if (zone.factor - 1.0).abs() < 1e-12 {
                extent / n
            } else {
                extent * (1.0 - zone.factor) / (1.0 - zone.factor.powf(n))
            };

            let mut width = first;
            for _ in 0..zone.cells {
                widths.push(width);
                width *= zone.factor;
            }
            cursor = zone.end;
        }

        if (cursor - length).abs() > 1e-12 * length {
            return Err(MeshError::Config(format!(
                "stretch zones end at {cursor}, axis length is {length}"
            )));
        }

        let mut positions = Vec::with_capacity(widths.len());
        let mut edge = 0.0;
        for &w in &widths {
            positions.push(edge + 0.5 * w);
            edge += w;
        }

        Ok(Self { widths, positions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_spacing() {
        let axis = AxisSpacing::build(4.0, 4, &[]).unwrap();
        assert_eq!(axis.widths, vec![1.0; 4]);
        assert_eq!(axis.positions, vec![0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn stretched_zone_fills_interval() {
        let zones = [
            StretchZone {
                start: 0.0,
                end: 1.0,
                factor: 1.0,
                cells: 2,
            },
            StretchZone {
                start: 1.0,
                end: 3.0,
                factor: 2.0,
                cells: 2,
            },
        ];
        let axis = AxisSpacing::build(3.0, 4, &zones).unwrap();
        let sum: f64 = axis.widths.iter().sum();
        assert!((sum - 3.0).abs() < 1e-12);
        // Geometric growth inside the second zone.
        assert!((axis.widths[3] / axis.widths[2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_gapped_zones() {
        let zones = [StretchZone {
            start: 0.5,
            end: 3.0,
            factor: 1.0,
            cells: 4,
        }];
        assert!(AxisSpacing::build(3.0, 4, &zones).is_err());
    }
}
