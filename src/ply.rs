//! PLY mesh parsing: header scan, vertex/face rows, per-vertex normals.

use std::io::Cursor;

use nalgebra as na;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Property, PropertyAccess};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bounds::Bounds;
use crate::decoder::DecodedPly;
use crate::error::{AssetError, AssetResult};

pub const DEFAULT_GRAY: [f32; 3] = [0.7, 0.7, 0.7];
pub const DEFAULT_NORMAL: [f32; 3] = [0.0, 1.0, 0.0];

/// Vertex properties that only appear in Gaussian splat exports.
const SPLAT_PROPERTIES: &[&str] = &["scale_0", "rot_0", "f_dc_0", "opacity"];

/// Shortest possible ASCII vertex row: `0 0 0\n`.
const MIN_ASCII_ROW_BYTES: usize = 6;

/// Vertex rows parsed between cancellation checks.
const CANCEL_CHECK_ROWS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlyEncoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

/// What to do with vertex rows that do not hold at least three numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlyParsePolicy {
    /// Skip the row and keep going; the skipped rows are counted.
    #[default]
    Lenient,
    /// Fail with [`AssetError::MalformedVertex`].
    Strict,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlyHeader {
    pub encoding: PlyEncoding,
    pub vertex_count: usize,
    pub face_count: usize,
    pub vertex_properties: Vec<String>,
    /// Number of lines up to and including `end_header`.
    pub header_lines: usize,
    /// Byte offset of the first body byte.
    pub body_offset: usize,
}

impl PlyHeader {
    pub fn is_splat(&self) -> bool {
        self.vertex_properties
            .iter()
            .any(|p| SPLAT_PROPERTIES.contains(&p.as_str()))
    }

    fn property_index(&self, name: &str) -> Option<usize> {
        self.vertex_properties.iter().position(|p| p == name)
    }

    /// Rejects a vertex count the body cannot hold, since every vertex takes
    /// at least one byte in any encoding.
    pub fn ensure_body_fits(&self, document_len: usize) -> AssetResult<()> {
        let body_len = document_len.saturating_sub(self.body_offset);
        if self.vertex_count > body_len {
            return Err(AssetError::MalformedPayload(format!(
                "{} vertices declared but the body has {} bytes",
                self.vertex_count, body_len
            )));
        }
        Ok(())
    }
}

/// Triangle mesh (or point cloud, when `face_indices` is empty) decoded from a PLY.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedGeometry {
    pub vertex_count: usize,
    pub declared_vertex_count: usize,
    pub skipped_lines: usize,
    pub positions: Vec<f32>,
    pub colors: Vec<f32>,
    pub normals: Vec<f32>,
    pub face_indices: Vec<u32>,
    pub bounds: Bounds,
}

impl ParsedGeometry {
    pub fn triangle_count(&self) -> usize {
        self.face_indices.len() / 3
    }
}

pub fn scan_header(bytes: &[u8]) -> AssetResult<PlyHeader> {
    let mut encoding = PlyEncoding::Ascii;
    let mut vertex_count = 0;
    let mut face_count = 0;
    let mut vertex_properties = Vec::new();
    let mut current_element = String::new();
    let mut offset = 0;

    for (index, raw_line) in bytes.split(|b| *b == b'\n').enumerate() {
        let line_end = offset + raw_line.len() + 1;
        offset = line_end;
        let line = String::from_utf8_lossy(raw_line);
        let line = line.strip_suffix('\r').unwrap_or(&*line);
        // The terminator must be the whole line, not just its only token.
        if line == "end_header" {
            return Ok(PlyHeader {
                encoding,
                vertex_count,
                face_count,
                vertex_properties,
                header_lines: index + 1,
                body_offset: line_end.min(bytes.len()),
            });
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match tokens.as_slice() {
            ["format", kind, ..] => {
                encoding = match *kind {
                    "ascii" => PlyEncoding::Ascii,
                    "binary_little_endian" => PlyEncoding::BinaryLittleEndian,
                    "binary_big_endian" => PlyEncoding::BinaryBigEndian,
                    other => {
                        return Err(AssetError::HeaderFieldInvalid {
                            field: "format".into(),
                            value: other.into(),
                        })
                    }
                };
            }
            ["element", name, rest @ ..] => {
                current_element = name.to_string();
                let count = match *name {
                    "vertex" => &mut vertex_count,
                    "face" => &mut face_count,
                    _ => continue,
                };
                let value = rest.first().copied().unwrap_or_default();
                *count = value.parse().map_err(|_| AssetError::HeaderFieldInvalid {
                    field: format!("element {name}"),
                    value: value.into(),
                })?;
            }
            ["property", .., name] if current_element == "vertex" => {
                vertex_properties.push(name.to_string());
            }
            _ => {}
        }
    }
    Err(AssetError::HeaderNotTerminated)
}

pub fn parse(doc: &DecodedPly) -> AssetResult<ParsedGeometry> {
    parse_with(doc, PlyParsePolicy::default())
}

pub fn parse_with(doc: &DecodedPly, policy: PlyParsePolicy) -> AssetResult<ParsedGeometry> {
    parse_cancellable(doc, policy, &CancellationToken::new())
}

/// Like [`parse_with`], but gives up with [`AssetError::Cancelled`] once
/// `cancel` fires. ASCII bodies are checked every few thousand rows.
pub fn parse_cancellable(
    doc: &DecodedPly,
    policy: PlyParsePolicy,
    cancel: &CancellationToken,
) -> AssetResult<ParsedGeometry> {
    let header = scan_header(&doc.bytes)?;
    let mesh = match header.encoding {
        PlyEncoding::Ascii => parse_ascii_body(&doc.bytes[header.body_offset..], &header, policy, cancel)?,
        _ => {
            header.ensure_body_fits(doc.bytes.len())?;
            parse_binary(&doc.bytes)?
        }
    };
    debug!(
        "Parsed {}: {} vertices, {} triangles",
        doc.name,
        mesh.vertex_count,
        mesh.triangle_count()
    );
    Ok(mesh)
}

fn parse_ascii_body(
    body: &[u8],
    header: &PlyHeader,
    policy: PlyParsePolicy,
    cancel: &CancellationToken,
) -> AssetResult<ParsedGeometry> {
    let text = String::from_utf8_lossy(body);
    let mut lines = text.lines();

    let red_column = header.property_index("red");
    // The declared count is untrusted; the body bounds how many rows can exist.
    let rows = header.vertex_count.min(body.len() / MIN_ASCII_ROW_BYTES);
    let mut positions = Vec::with_capacity(rows * 3);
    let mut colors = Vec::with_capacity(rows * 3);
    // Declared index -> decoded index; `None` for skipped rows.
    let mut remap: Vec<Option<u32>> = Vec::with_capacity(rows);

    for row in 0..header.vertex_count {
        if row % CANCEL_CHECK_ROWS == 0 && cancel.is_cancelled() {
            return Err(AssetError::Cancelled);
        }
        let Some(line) = lines.next() else {
            if policy == PlyParsePolicy::Strict {
                return Err(AssetError::MalformedVertex { line: header.header_lines + row + 1 });
            }
            // Body ran out; the missing rows are counted as skipped.
            break;
        };
        let Some(values) = parse_vertex_row(line) else {
            if policy == PlyParsePolicy::Strict {
                return Err(AssetError::MalformedVertex { line: header.header_lines + row + 1 });
            }
            remap.push(None);
            continue;
        };

        remap.push(Some((positions.len() / 3) as u32));
        positions.extend_from_slice(&values[..3]);
        let rgb_start = red_column.unwrap_or(3);
        match values.get(rgb_start..rgb_start + 3) {
            Some(rgb) if values.len() >= 6 => {
                colors.extend(rgb.iter().map(|c| (c / 255.0).clamp(0.0, 1.0)));
            }
            _ => colors.extend_from_slice(&DEFAULT_GRAY),
        }
    }

    let mut face_indices = Vec::new();
    for line in lines.take(header.face_count) {
        if let Some(triangle) = parse_triangle_row(line, &remap) {
            face_indices.extend_from_slice(&triangle);
        }
    }

    Ok(finish_geometry(header.vertex_count, positions, colors, face_indices))
}

/// Leading x, y, z must be numbers; trailing columns stop at the first non-number.
fn parse_vertex_row(line: &str) -> Option<Vec<f32>> {
    let values: Vec<f32> = line
        .split_whitespace()
        .map_while(|token| token.parse::<f32>().ok())
        .collect();
    (values.len() >= 3).then_some(values)
}

fn parse_triangle_row(line: &str, remap: &[Option<u32>]) -> Option<[u32; 3]> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 || tokens[0] != "3" {
        return None;
    }
    let mut triangle = [0u32; 3];
    for (slot, token) in triangle.iter_mut().zip(&tokens[1..4]) {
        let declared: usize = token.parse().ok()?;
        *slot = (*remap.get(declared)?)?;
    }
    Some(triangle)
}

#[derive(Default)]
struct MeshVertex {
    position: [f32; 3],
    color: Option<[f32; 3]>,
}

impl MeshVertex {
    fn set_channel(&mut self, channel: usize, value: f32) {
        self.color.get_or_insert(DEFAULT_GRAY)[channel] = value.clamp(0.0, 1.0);
    }
}

impl PropertyAccess for MeshVertex {
    fn new() -> Self {
        Self::default()
    }

    fn set_property(&mut self, property_name: String, property: Property) {
        let value = match property {
            Property::Float(v) => v,
            Property::Double(v) => v as f32,
            Property::UChar(v) => v as f32 / 255.0,
            Property::UShort(v) => v as f32 / 65535.0,
            _ => return,
        };
        match property_name.as_ref() {
            "x" => self.position[0] = value,
            "y" => self.position[1] = value,
            "z" => self.position[2] = value,
            "red" => self.set_channel(0, value),
            "green" => self.set_channel(1, value),
            "blue" => self.set_channel(2, value),
            _ => {}
        }
    }
}

#[derive(Default)]
struct MeshFace {
    indices: Vec<i64>,
}

impl PropertyAccess for MeshFace {
    fn new() -> Self {
        Self::default()
    }

    fn set_property(&mut self, property_name: String, property: Property) {
        if property_name != "vertex_indices" && property_name != "vertex_index" {
            return;
        }
        self.indices = match property {
            Property::ListInt(v) => v.into_iter().map(i64::from).collect(),
            Property::ListUInt(v) => v.into_iter().map(i64::from).collect(),
            Property::ListShort(v) => v.into_iter().map(i64::from).collect(),
            Property::ListUShort(v) => v.into_iter().map(i64::from).collect(),
            Property::ListChar(v) => v.into_iter().map(i64::from).collect(),
            Property::ListUChar(v) => v.into_iter().map(i64::from).collect(),
            _ => return,
        };
    }
}

fn payload_error(err: std::io::Error) -> AssetError {
    AssetError::MalformedPayload(err.to_string())
}

fn parse_binary(bytes: &[u8]) -> AssetResult<ParsedGeometry> {
    let mut reader = Cursor::new(bytes);
    let vertex_parser = Parser::<MeshVertex>::new();
    let face_parser = Parser::<MeshFace>::new();
    let other_parser = Parser::<DefaultElement>::new();
    let header = vertex_parser.read_header(&mut reader).map_err(payload_error)?;

    let mut vertices = Vec::new();
    let mut faces = Vec::new();
    for (_, element) in &header.elements {
        match element.name.as_ref() {
            "vertex" => {
                vertices = vertex_parser
                    .read_payload_for_element(&mut reader, element, &header)
                    .map_err(payload_error)?;
            }
            "face" => {
                faces = face_parser
                    .read_payload_for_element(&mut reader, element, &header)
                    .map_err(payload_error)?;
            }
            _ => {
                other_parser
                    .read_payload_for_element(&mut reader, element, &header)
                    .map_err(payload_error)?;
            }
        }
    }

    let vertex_count = vertices.len();
    let mut positions = Vec::with_capacity(vertex_count * 3);
    let mut colors = Vec::with_capacity(vertex_count * 3);
    for vertex in &vertices {
        positions.extend_from_slice(&vertex.position);
        colors.extend_from_slice(&vertex.color.unwrap_or(DEFAULT_GRAY));
    }
    let face_indices = faces
        .iter()
        .filter(|f| f.indices.len() == 3)
        .filter(|f| f.indices.iter().all(|&i| i >= 0 && (i as usize) < vertex_count))
        .flat_map(|f| f.indices.iter().map(|&i| i as u32))
        .collect();

    Ok(finish_geometry(vertex_count, positions, colors, face_indices))
}

fn finish_geometry(
    declared_vertex_count: usize,
    positions: Vec<f32>,
    colors: Vec<f32>,
    face_indices: Vec<u32>,
) -> ParsedGeometry {
    let vertex_count = positions.len() / 3;
    let skipped_lines = declared_vertex_count.saturating_sub(vertex_count);
    if skipped_lines > 0 {
        warn!("Skipped {} malformed vertex rows of {}", skipped_lines, declared_vertex_count);
    }
    let normals = compute_normals(&positions, &face_indices);
    let bounds = Bounds::from_xyz(&positions);
    ParsedGeometry {
        vertex_count,
        declared_vertex_count,
        skipped_lines,
        positions,
        colors,
        normals,
        face_indices,
        bounds,
    }
}

/// Averages unit face normals around each vertex. Vertices without a usable
/// adjacent face point straight up.
pub fn compute_normals(positions: &[f32], face_indices: &[u32]) -> Vec<f32> {
    let vertex_count = positions.len() / 3;
    let point = |i: u32| {
        let i = i as usize * 3;
        na::Vector3::new(positions[i], positions[i + 1], positions[i + 2])
    };

    let mut sums = vec![na::Vector3::<f32>::zeros(); vertex_count];
    for tri in face_indices.chunks_exact(3) {
        let (a, b, c) = (point(tri[0]), point(tri[1]), point(tri[2]));
        let Some(normal) = (b - a).cross(&(c - a)).try_normalize(f32::EPSILON) else {
            continue;
        };
        for &i in tri {
            sums[i as usize] += normal;
        }
    }

    let up = na::Vector3::from(DEFAULT_NORMAL);
    sums.iter()
        .flat_map(|sum| {
            let n = sum.try_normalize(f32::EPSILON).unwrap_or(up);
            [n.x, n.y, n.z]
        })
        .collect()
}
