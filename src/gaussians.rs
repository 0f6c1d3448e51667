use std::io::Cursor;

use nalgebra as na;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Property, PropertyAccess};
use tracing::{debug, info};

use crate::bounds::Bounds;
use crate::decoder::DecodedPly;
use crate::error::{AssetError, AssetResult};
use crate::projection;

/// Zeroth-order spherical harmonic coefficient.
const SH_C0: f32 = 0.28209479177387814f32;

pub const DEFAULT_MAX_SPLATS: usize = 50_000;

const MIN_RAW_SCALE: f32 = 0.01;
const MIN_RAW_CHANNEL: f32 = 0.1;

#[derive(Clone, Debug, PartialEq)]
pub struct Gaussian {
    pub position: na::Vector3<f32>,
    pub scale: na::Vector3<f32>,
    /// Unit quaternion as `[x, y, z, w]`.
    pub rotation: na::Vector4<f32>,
    pub color: na::Vector3<f32>,
    pub opacity: f32,
}

impl Gaussian {
    pub fn cov3d(&self) -> na::Matrix3<f32> {
        projection::covariance_3d(&self.scale, &self.rotation)
    }
}

/// All splats of one asset. Rebuilt from scratch on every load.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplatSet {
    pub splats: Vec<Gaussian>,
    pub bounds: Bounds,
}

impl SplatSet {
    pub fn new(splats: Vec<Gaussian>) -> Self {
        let centers: Vec<f32> = splats.iter().flat_map(|g| g.position.iter().copied()).collect();
        let bounds = Bounds::from_xyz(&centers);
        Self { splats, bounds }
    }

    pub fn count(&self) -> usize {
        self.splats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splats.is_empty()
    }
}

/// How the vertex properties of a splat PLY are encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplatLayout {
    /// Linear scales, byte colors and opacity, `rot_0..3` = `x, y, z, w`.
    Raw,
    /// Optimizer output: log scales, logit opacity, SH DC color, `rot_0` = `w`.
    Trained,
}

impl SplatLayout {
    pub fn detect(vertex_properties: &[String]) -> Self {
        if vertex_properties.iter().any(|p| p == "f_dc_0") {
            SplatLayout::Trained
        } else {
            SplatLayout::Raw
        }
    }
}

/// One `vertex` row as read from the file, before layout-specific decoding.
#[derive(Clone, Debug)]
struct SplatRecord {
    position: [f32; 3],
    scale: Option<[f32; 3]>,
    rotation: [f32; 4],
    color: [f32; 3],
    f_dc: [f32; 3],
    opacity: Option<f32>,
}

impl PropertyAccess for SplatRecord {
    fn new() -> Self {
        Self {
            position: [0.0; 3],
            scale: None,
            rotation: [0.0; 4],
            color: [0.5; 3],
            f_dc: [0.0; 3],
            opacity: None,
        }
    }

    // Set properties from the PLY file
    fn set_property(&mut self, property_name: String, property: Property) {
        let value = match property {
            Property::Float(v) => v,
            Property::Double(v) => v as f32,
            Property::UChar(v) => v as f32 / 255.0,
            _ => return,
        };
        match property_name.as_ref() {
            "x" => self.position[0] = value,
            "y" => self.position[1] = value,
            "z" => self.position[2] = value,
            "scale_0" | "scale_x" => self.scale.get_or_insert([0.1; 3])[0] = value,
            "scale_1" | "scale_y" => self.scale.get_or_insert([0.1; 3])[1] = value,
            "scale_2" | "scale_z" => self.scale.get_or_insert([0.1; 3])[2] = value,
            "rot_0" | "qx" => self.rotation[0] = value,
            "rot_1" | "qy" => self.rotation[1] = value,
            "rot_2" | "qz" => self.rotation[2] = value,
            "rot_3" | "qw" => self.rotation[3] = value,
            "red" => self.color[0] = value,
            "green" => self.color[1] = value,
            "blue" => self.color[2] = value,
            "f_dc_0" => self.f_dc[0] = value,
            "f_dc_1" => self.f_dc[1] = value,
            "f_dc_2" => self.f_dc[2] = value,
            "opacity" | "alpha" => self.opacity = Some(value),
            _ => {}
        }
    }
}

impl SplatRecord {
    fn into_gaussian(self, layout: SplatLayout) -> Option<Gaussian> {
        let position = na::Vector3::from(self.position);
        let (scale, rotation, color, opacity) = match layout {
            SplatLayout::Raw => (
                na::Vector3::from(self.scale.unwrap_or([0.1; 3])).map(|s| s.abs().max(MIN_RAW_SCALE)),
                na::Vector4::from(self.rotation),
                na::Vector3::from(self.color).map(|c| c.clamp(MIN_RAW_CHANNEL, 1.0)),
                self.opacity.map_or(1.0, |a| a.clamp(MIN_RAW_CHANNEL, 1.0)),
            ),
            SplatLayout::Trained => {
                let [w, x, y, z] = self.rotation;
                (
                    na::Vector3::from(self.scale.unwrap_or([0.0; 3])).map(|s| s.exp().max(f32::MIN_POSITIVE)),
                    na::Vector4::new(x, y, z, w),
                    na::Vector3::from(self.f_dc).map(|c| (0.5 + SH_C0 * c).clamp(0.0, 1.0)),
                    self.opacity.map_or(1.0, sigmoid),
                )
            }
        };

        if !position.iter().chain(scale.iter()).all(|v| v.is_finite()) {
            return None;
        }
        Some(Gaussian {
            position,
            scale,
            rotation: normalize_quaternion(rotation),
            color,
            opacity: if opacity.is_finite() { opacity } else { 1.0 },
        })
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Normalizes `[x, y, z, w]`; near-zero quaternions become the identity.
pub fn normalize_quaternion(q: na::Vector4<f32>) -> na::Vector4<f32> {
    let len = q.norm();
    if len > 0.001 && len.is_finite() {
        q / len
    } else {
        na::Vector4::new(0.0, 0.0, 0.0, 1.0)
    }
}

fn payload_error(err: std::io::Error) -> AssetError {
    AssetError::MalformedPayload(err.to_string())
}

/// Reads the `vertex` element of a splat PLY, keeping at most `max_splats`
/// evenly strided splats (`0` keeps all of them).
pub fn load_splats(doc: &DecodedPly, max_splats: usize) -> AssetResult<SplatSet> {
    let ply_header = crate::ply::scan_header(&doc.bytes)?;
    ply_header.ensure_body_fits(doc.bytes.len())?;
    let layout = SplatLayout::detect(&ply_header.vertex_properties);

    let mut reader = Cursor::new(doc.bytes.as_slice());
    let gaus_parser = Parser::<SplatRecord>::new();
    let skip_parser = Parser::<DefaultElement>::new();
    let header = gaus_parser.read_header(&mut reader).map_err(payload_error)?;

    let mut records = Vec::new();
    for (_ignore_key, element) in &header.elements {
        if element.name == "vertex" {
            records = gaus_parser
                .read_payload_for_element(&mut reader, element, &header)
                .map_err(payload_error)?;
            break;
        }
        skip_parser
            .read_payload_for_element(&mut reader, element, &header)
            .map_err(payload_error)?;
    }

    let total = records.len();
    let limit = if max_splats == 0 { total } else { max_splats.min(total) };
    let step = if limit == 0 { 1 } else { (total / limit).max(1) };
    let splats: Vec<Gaussian> = records
        .into_iter()
        .step_by(step)
        .filter_map(|r| r.into_gaussian(layout))
        .take(limit)
        .collect();

    if splats.len() < total {
        debug!("Kept {} of {} splats (stride {})", splats.len(), total, step);
    }
    info!("Loaded {} splats from {} ({:?} layout)", splats.len(), doc.name, layout);
    Ok(SplatSet::new(splats))
}
