//! Flat per-instance attribute arrays fed to the splat pipeline.

use nalgebra as na;

use crate::error::{AssetError, AssetResult};
use crate::gaussians::SplatSet;

/// Five parallel arrays indexed by splat, uploaded once per asset load.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstancedAttributeArrays {
    pub positions: Vec<f32>,
    pub colors: Vec<f32>,
    pub scales: Vec<f32>,
    pub rotations: Vec<f32>,
    pub opacities: Vec<f32>,
}

impl InstancedAttributeArrays {
    /// An empty set gives empty arrays; callers decide whether to draw a placeholder.
    pub fn build(splats: &SplatSet) -> Self {
        let n = splats.count();
        let mut out = Self {
            positions: Vec::with_capacity(n * 3),
            colors: Vec::with_capacity(n * 3),
            scales: Vec::with_capacity(n * 3),
            rotations: Vec::with_capacity(n * 4),
            opacities: Vec::with_capacity(n),
        };
        for g in &splats.splats {
            out.positions.extend_from_slice(g.position.as_slice());
            out.colors.extend_from_slice(g.color.as_slice());
            out.scales.extend_from_slice(g.scale.as_slice());
            out.rotations.extend_from_slice(g.rotation.as_slice());
            out.opacities.push(g.opacity);
        }
        out
    }

    /// Wraps arrays produced elsewhere, checking every length against the opacity count.
    pub fn from_arrays(
        positions: Vec<f32>,
        colors: Vec<f32>,
        scales: Vec<f32>,
        rotations: Vec<f32>,
        opacities: Vec<f32>,
    ) -> AssetResult<Self> {
        let count = opacities.len();
        for (attribute, values, width) in [
            ("positions", &positions, 3),
            ("colors", &colors, 3),
            ("scales", &scales, 3),
            ("rotations", &rotations, 4),
        ] {
            if values.len() != count * width {
                return Err(AssetError::InvalidInstanceBuffer {
                    attribute,
                    expected: count * width,
                    actual: values.len(),
                });
            }
        }
        Ok(Self { positions, colors, scales, rotations, opacities })
    }

    pub fn count(&self) -> usize {
        self.opacities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opacities.is_empty()
    }

    pub fn position(&self, i: usize) -> na::Vector3<f32> {
        na::Vector3::from_column_slice(&self.positions[i * 3..i * 3 + 3])
    }

    pub fn color(&self, i: usize) -> na::Vector3<f32> {
        na::Vector3::from_column_slice(&self.colors[i * 3..i * 3 + 3])
    }

    pub fn scale(&self, i: usize) -> na::Vector3<f32> {
        na::Vector3::from_column_slice(&self.scales[i * 3..i * 3 + 3])
    }

    pub fn rotation(&self, i: usize) -> na::Vector4<f32> {
        na::Vector4::from_column_slice(&self.rotations[i * 4..i * 4 + 4])
    }

    pub fn opacity(&self, i: usize) -> f32 {
        self.opacities[i]
    }
}

/// Owns the splat set of the active asset together with its instance arrays.
#[derive(Clone, Debug, Default)]
pub struct SplatRenderBuffer {
    splats: SplatSet,
    attributes: InstancedAttributeArrays,
}

impl SplatRenderBuffer {
    pub fn new(splats: SplatSet) -> Self {
        let attributes = InstancedAttributeArrays::build(&splats);
        Self { splats, attributes }
    }

    pub fn splats(&self) -> &SplatSet {
        &self.splats
    }

    pub fn attributes(&self) -> &InstancedAttributeArrays {
        &self.attributes
    }
}
