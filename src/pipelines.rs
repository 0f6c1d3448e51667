use euc::{Buffer2d, CullMode, DepthMode, Pipeline, Target, TriangleList};
use nalgebra as na;
use na::{Matrix3, Matrix4, SVector, Vector2, Vector3, Vector4};

use crate::ply::ParsedGeometry;
use crate::projection::{self, ProjectedSplat, ShaderUniforms, CULLED_POSITION, GAMMA};
use crate::splat_buffer::InstancedAttributeArrays;

/// Billboard corners shared by every instance, drawn as two triangles.
pub const VERTICES: &[Vector2<f32>] = &[
    Vector2::new(-1., 1.),
    Vector2::new(-1., -1.),
    Vector2::new(1., -1.),
    Vector2::new(1., 1.),
];

pub const INDICES: &[usize] = &[0, 1, 2, 0, 2, 3];

/// Linear-space clear color.
pub const BACKGROUND: Vector4<f32> = Vector4::new(0.01, 0.01, 0.012, 1.0);

pub const AMBIENT: f32 = 0.4;
/// Half size of the quad drawn for each vertex of a point-only mesh, in pixels.
pub const POINT_RADIUS_PX: f32 = 1.5;

/// Color and depth targets for one viewport.
pub struct FrameBuffers {
    pub color: Buffer2d<Vector4<f32>>,
    pub depth: Buffer2d<f32>,
    width: usize,
    height: usize,
}

impl FrameBuffers {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            color: Buffer2d::fill([width, height], BACKGROUND),
            depth: Buffer2d::fill([width, height], 1.0),
            width,
            height,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn clear(&mut self) {
        self.color.clear(BACKGROUND);
        self.depth.clear(1.0);
    }

    /// Linear color at `(x, y)`, row 0 at the top.
    pub fn pixel(&self, x: usize, y: usize) -> Vector4<f32> {
        self.color.raw()[y * self.width + x]
    }

    /// Gamma-encodes the linear color buffer into `0RGB` words for the window.
    pub fn to_argb(&self, out: &mut Vec<u32>) {
        out.clear();
        out.extend(self.color.raw().iter().map(|c| {
            let encode = |v: f32| (v.max(0.0).powf(1.0 / GAMMA).min(1.0) * 255.0).round() as u32;
            (encode(c.x) << 16) | (encode(c.y) << 8) | encode(c.z)
        }));
    }
}

/// One splat as seen by the rasterizer this frame.
#[derive(Clone, Debug)]
pub struct SplatInstance {
    pub projected: Option<ProjectedSplat>,
    pub color: Vector3<f32>,
    pub opacity: f32,
}

#[derive(Clone, Debug)]
pub struct VertexInstance {
    pub vert_idx: usize,
    pub instance_idx: usize,
}

/// Instanced splat pipeline. The projection runs once per instance when the
/// pipeline is prepared; `vertex` only places the corners.
pub struct GaussianSplatPipeline {
    pub instances: Vec<SplatInstance>,
    pub uniforms: ShaderUniforms,
}

impl GaussianSplatPipeline {
    pub fn prepare(
        attributes: &InstancedAttributeArrays,
        model_view: &Matrix4<f32>,
        projection: &Matrix4<f32>,
        uniforms: ShaderUniforms,
    ) -> Self {
        let instances = (0..attributes.count())
            .map(|i| SplatInstance {
                projected: projection::project_splat(
                    &attributes.position(i),
                    &attributes.scale(i),
                    &attributes.rotation(i),
                    model_view,
                    projection,
                    &uniforms,
                ),
                color: attributes.color(i),
                opacity: attributes.opacity(i),
            })
            .collect();
        Self { instances, uniforms }
    }

    pub fn visible_count(&self) -> usize {
        self.instances.iter().filter(|i| i.projected.is_some()).count()
    }

    pub fn render_to_buffer(&self, frame: &mut FrameBuffers) {
        // Culled instances never reach the rasterizer
        let mut vertex_instances = Vec::with_capacity(self.visible_count() * INDICES.len());
        for (instance_idx, instance) in self.instances.iter().enumerate() {
            if instance.projected.is_none() {
                continue;
            }
            for vert_idx in INDICES {
                vertex_instances.push(VertexInstance {
                    vert_idx: *vert_idx,
                    instance_idx,
                });
            }
        }
        self.render(vertex_instances, &mut frame.color, &mut frame.depth);
    }
}

impl<'r> Pipeline<'r> for GaussianSplatPipeline {
    type Vertex = VertexInstance;
    type VertexData = SVector<f32, 9>; // color, opacity, conic, pixel offset
    type Primitives = TriangleList;
    type Fragment = Vector4<f32>;
    type Pixel = Vector4<f32>;

    fn depth_mode(&self) -> DepthMode {
        DepthMode::LESS_PASS
    }

    fn vertex(&self, vert_inst: &Self::Vertex) -> ([f32; 4], Self::VertexData) {
        let instance = &self.instances[vert_inst.instance_idx];
        let Some(projected) = instance.projected else {
            return (CULLED_POSITION, SVector::zeros());
        };
        let corner = VERTICES[vert_inst.vert_idx];
        let offset = corner * projected.radius;
        let vertex_data = SVector::<f32, 9>::from_row_slice(&[
            instance.color[0],
            instance.color[1],
            instance.color[2],
            instance.opacity,
            projected.conic[0],
            projected.conic[1],
            projected.conic[2],
            offset[0],
            offset[1],
        ]);
        (projected.corner_clip_position(&corner, &self.uniforms), vertex_data)
    }

    fn fragment(&self, vert_output: Self::VertexData) -> Self::Fragment {
        let color = Vector3::new(vert_output[0], vert_output[1], vert_output[2]);
        let conic = Vector3::new(vert_output[4], vert_output[5], vert_output[6]);
        let offset = Vector2::new(vert_output[7], vert_output[8]);
        match projection::fragment_alpha(&conic, &offset, vert_output[3]) {
            Some(alpha) => projection::shade(&color, alpha),
            None => Self::Fragment::zeros(),
        }
    }

    fn blend(&self, old_color: Self::Pixel, new_color: Self::Fragment) -> Self::Pixel {
        // Premultiplied additive; a discarded fragment adds nothing
        old_color + new_color
    }
}

/// A mesh corner after lighting, ready for rasterization.
#[derive(Clone, Debug)]
pub struct ShadedVertex {
    pub clip: Vector4<f32>,
    pub color: Vector3<f32>,
}

/// Gouraud-shaded triangles for PLY meshes and the placeholder.
pub struct MeshPipeline {
    pub vertices: Vec<ShadedVertex>,
}

impl MeshPipeline {
    pub fn light_direction() -> Vector3<f32> {
        Vector3::new(0.4, 1.0, 0.6).normalize()
    }

    pub fn prepare(
        geometry: &ParsedGeometry,
        model: &Matrix4<f32>,
        view: &Matrix4<f32>,
        projection: &Matrix4<f32>,
        uniforms: &ShaderUniforms,
    ) -> Self {
        let mvp = projection * view * model;
        let normal_matrix: Matrix3<f32> = model.fixed_view::<3, 3>(0, 0).into_owned();
        let light = Self::light_direction();

        let shaded: Vec<ShadedVertex> = (0..geometry.vertex_count)
            .map(|i| {
                let p = Vector3::from_column_slice(&geometry.positions[i * 3..i * 3 + 3]);
                let n = normal_matrix * Vector3::from_column_slice(&geometry.normals[i * 3..i * 3 + 3]);
                let c = Vector3::from_column_slice(&geometry.colors[i * 3..i * 3 + 3]);
                let lambert = n.try_normalize(f32::EPSILON).map_or(0.0, |n| n.dot(&light).max(0.0));
                let lit = AMBIENT + (1.0 - AMBIENT) * lambert;
                ShadedVertex {
                    clip: mvp * p.push(1.0),
                    color: c.map(|v| v.max(0.0).powf(GAMMA)) * lit,
                }
            })
            .collect();

        let vertices = if geometry.face_indices.is_empty() {
            point_quads(&shaded, uniforms)
        } else {
            geometry
                .face_indices
                .iter()
                .filter_map(|&i| shaded.get(i as usize).cloned())
                .collect()
        };
        Self { vertices }
    }

    pub fn render_to_buffer(&self, frame: &mut FrameBuffers) {
        self.render(self.vertices.clone(), &mut frame.color, &mut frame.depth);
    }
}

/// Expands every vertex into a screen-aligned quad of [`POINT_RADIUS_PX`].
fn point_quads(shaded: &[ShadedVertex], uniforms: &ShaderUniforms) -> Vec<ShadedVertex> {
    let half = Vector2::repeat(POINT_RADIUS_PX * 2.0).component_div(&uniforms.screen_size);
    shaded
        .iter()
        .filter(|v| v.clip.w > 0.0)
        .flat_map(|v| {
            INDICES.iter().map(move |&idx| {
                let offset = VERTICES[idx].component_mul(&half) * v.clip.w;
                ShadedVertex {
                    clip: Vector4::new(v.clip.x + offset.x, v.clip.y + offset.y, v.clip.z, v.clip.w),
                    color: v.color,
                }
            })
        })
        .collect()
}

impl<'r> Pipeline<'r> for MeshPipeline {
    type Vertex = ShadedVertex;
    type VertexData = Vector3<f32>;
    type Primitives = TriangleList;
    type Fragment = Vector4<f32>;
    type Pixel = Vector4<f32>;

    fn depth_mode(&self) -> DepthMode {
        DepthMode::LESS_WRITE
    }

    fn rasterizer_config(&self) -> CullMode {
        CullMode::None
    }

    fn vertex(&self, vertex: &Self::Vertex) -> ([f32; 4], Self::VertexData) {
        let clip = vertex.clip;
        ([clip.x, clip.y, clip.z, clip.w], vertex.color)
    }

    fn fragment(&self, color: Self::VertexData) -> Self::Fragment {
        color.push(1.0)
    }

    fn blend(&self, _old_color: Self::Pixel, new_color: Self::Fragment) -> Self::Pixel {
        new_color
    }
}

/// Gray unit cube with flat face normals, shown when there is no model to draw.
pub fn placeholder_cube() -> ParsedGeometry {
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        // normal, u, v
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
    ];
    let mut positions = Vec::with_capacity(24 * 3);
    let mut normals = Vec::with_capacity(24 * 3);
    let mut face_indices = Vec::with_capacity(36);
    for (face, (n, u, v)) in FACES.iter().enumerate() {
        let (n, u, v) = (Vector3::from(*n), Vector3::from(*u), Vector3::from(*v));
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let corner = (n + u * su + v * sv) * 0.5;
            positions.extend_from_slice(corner.as_slice());
            normals.extend_from_slice(n.as_slice());
        }
        let base = (face * 4) as u32;
        face_indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    ParsedGeometry {
        vertex_count: 24,
        declared_vertex_count: 24,
        skipped_lines: 0,
        colors: [0.5f32; 3].repeat(24),
        bounds: crate::bounds::Bounds::from_xyz(&positions),
        positions,
        normals,
        face_indices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussians::{Gaussian, SplatSet};
    use approx::assert_relative_eq;

    const W: usize = 64;
    const H: usize = 48;

    fn camera_at(z: f32) -> (Matrix4<f32>, Matrix4<f32>) {
        let view = Matrix4::new_translation(&Vector3::new(0.0, 0.0, -z));
        let projection = Matrix4::new_perspective(W as f32 / H as f32, 50f32.to_radians(), 0.1, 1000.0);
        (view, projection)
    }

    fn splat_at(position: Vector3<f32>, color: Vector3<f32>) -> Gaussian {
        Gaussian {
            position,
            scale: Vector3::repeat(0.2),
            rotation: Vector4::new(0.0, 0.0, 0.0, 1.0),
            color,
            opacity: 0.9,
        }
    }

    #[test]
    fn splat_lights_the_center_pixel() {
        let set = SplatSet::new(vec![splat_at(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0))]);
        let attributes = InstancedAttributeArrays::build(&set);
        let (view, projection) = camera_at(5.0);
        let uniforms = ShaderUniforms::for_viewport(W as f32, H as f32);

        let pipeline = GaussianSplatPipeline::prepare(&attributes, &view, &projection, uniforms);
        assert_eq!(pipeline.visible_count(), 1);

        let mut frame = FrameBuffers::new(W, H);
        pipeline.render_to_buffer(&mut frame);

        let center = frame.pixel(W / 2, H / 2);
        assert!(center.x > BACKGROUND.x + 0.5, "{:?}", center);
        assert_relative_eq!(center.y, BACKGROUND.y, epsilon = 1e-6);
        assert_eq!(frame.pixel(0, 0), BACKGROUND);
    }

    #[test]
    fn overlapping_splats_add_up() {
        let one = SplatSet::new(vec![splat_at(Vector3::zeros(), Vector3::new(0.5, 0.5, 0.5))]);
        let two = SplatSet::new(vec![
            splat_at(Vector3::zeros(), Vector3::new(0.5, 0.5, 0.5)),
            splat_at(Vector3::zeros(), Vector3::new(0.5, 0.5, 0.5)),
        ]);
        let (view, projection) = camera_at(5.0);
        let uniforms = ShaderUniforms::for_viewport(W as f32, H as f32);

        let mut lit = Vec::new();
        for set in [one, two] {
            let attributes = InstancedAttributeArrays::build(&set);
            let mut frame = FrameBuffers::new(W, H);
            GaussianSplatPipeline::prepare(&attributes, &view, &projection, uniforms).render_to_buffer(&mut frame);
            lit.push(frame.pixel(W / 2, H / 2) - BACKGROUND);
        }
        assert_relative_eq!(lit[1], lit[0] * 2.0, epsilon = 1e-4);
    }

    #[test]
    fn culled_instances_are_parked_outside_the_clip_volume() {
        let set = SplatSet::new(vec![splat_at(Vector3::new(0.0, 0.0, 10.0), Vector3::repeat(1.0))]);
        let attributes = InstancedAttributeArrays::build(&set);
        let (view, projection) = camera_at(5.0);
        let uniforms = ShaderUniforms::for_viewport(W as f32, H as f32);

        let pipeline = GaussianSplatPipeline::prepare(&attributes, &view, &projection, uniforms);
        assert_eq!(pipeline.visible_count(), 0);
        let (clip, _) = pipeline.vertex(&VertexInstance { vert_idx: 0, instance_idx: 0 });
        assert_eq!(clip, CULLED_POSITION);

        let mut frame = FrameBuffers::new(W, H);
        pipeline.render_to_buffer(&mut frame);
        assert!(frame.color.raw().iter().all(|c| *c == BACKGROUND));
    }

    #[test]
    fn fragment_outside_footprint_is_discarded() {
        let pipeline = GaussianSplatPipeline {
            instances: Vec::new(),
            uniforms: ShaderUniforms::for_viewport(W as f32, H as f32),
        };
        let far = SVector::<f32, 9>::from_row_slice(&[1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 5.0, 0.0]);
        assert_eq!(pipeline.fragment(far), Vector4::zeros());
        let near = SVector::<f32, 9>::from_row_slice(&[1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(pipeline.fragment(near), Vector4::new(1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn placeholder_cube_renders_in_the_middle() {
        let cube = placeholder_cube();
        assert_eq!(cube.triangle_count(), 12);
        assert_relative_eq!(cube.bounds.size(), Vector3::repeat(1.0));

        let (view, projection) = camera_at(3.0);
        let uniforms = ShaderUniforms::for_viewport(W as f32, H as f32);
        let pipeline = MeshPipeline::prepare(&cube, &Matrix4::identity(), &view, &projection, &uniforms);
        assert_eq!(pipeline.vertices.len(), 36);

        let mut frame = FrameBuffers::new(W, H);
        pipeline.render_to_buffer(&mut frame);
        let center = frame.pixel(W / 2, H / 2);
        // Front face points at the camera: ambient plus a partial Lambert term.
        assert!(center.x > 0.5f32.powf(GAMMA) * AMBIENT - 1e-4, "{:?}", center);
        assert_eq!(frame.pixel(0, 0), BACKGROUND);
    }

    #[test]
    fn point_only_mesh_draws_quads() {
        let mut cloud = placeholder_cube();
        cloud.face_indices.clear();
        let (view, projection) = camera_at(3.0);
        let uniforms = ShaderUniforms::for_viewport(W as f32, H as f32);
        let pipeline = MeshPipeline::prepare(&cloud, &Matrix4::identity(), &view, &projection, &uniforms);
        assert_eq!(pipeline.vertices.len(), 24 * INDICES.len());
    }

    #[test]
    fn argb_is_gamma_encoded_and_clamped() {
        let mut frame = FrameBuffers::new(2, 1);
        frame.color = Buffer2d::fill([2, 1], Vector4::new(2.0, (128.0f32 / 255.0).powf(GAMMA), -1.0, 1.0));
        let mut out = Vec::new();
        frame.to_argb(&mut out);
        assert_eq!(out, vec![0x00ff8000; 2]);
    }
}
