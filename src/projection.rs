//! Screen-space projection of 3D Gaussians.
//!
//! Every step of the per-instance vertex stage is a free function over plain
//! nalgebra values so it can be checked without a rasterizer. The pipeline in
//! `pipelines.rs` calls [`project_splat`] once per instance per frame and
//! [`fragment_alpha`] once per covered pixel.

use nalgebra as na;
use na::{Matrix2, Matrix2x3, Matrix3, Matrix4, Vector2, Vector3, Vector4};

/// Added to both diagonal terms of the 2D covariance.
pub const LOW_PASS: f32 = 0.3;
/// Lower bound on the eigenvalue discriminant.
pub const DISCRIMINANT_FLOOR: f32 = 0.1;
pub const MIN_RADIUS_PX: f32 = 2.0;
/// Field of view used to derive the focal length uniforms.
pub const REFERENCE_FOV_DEG: f32 = 50.0;

pub const MAX_POWER: f32 = 0.0;
pub const MIN_POWER: f32 = -4.0;
pub const MIN_ALPHA: f32 = 0.01;
pub const GAMMA: f32 = 2.2;

/// Clip position outside the clip volume; culled instances are parked here.
pub const CULLED_POSITION: [f32; 4] = [0.0, 0.0, 2.0, 1.0];

/// Per-frame uniforms shared by every splat.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShaderUniforms {
    pub screen_size: Vector2<f32>,
    pub focal_x: f32,
    pub focal_y: f32,
}

impl ShaderUniforms {
    /// Uses the reference FOV and the viewport height for both focal terms,
    /// which assumes square pixels.
    pub fn for_viewport(width: f32, height: f32) -> Self {
        let focal = focal_from_fov(height, REFERENCE_FOV_DEG.to_radians());
        Self {
            screen_size: Vector2::new(width, height),
            focal_x: focal,
            focal_y: focal,
        }
    }
}

pub fn focal_from_fov(height: f32, fov_radians: f32) -> f32 {
    (height / 2.0) / (fov_radians / 2.0).tan()
}

/// Quaternion stored as `[x, y, z, w]`, assumed unit length.
pub fn quat_to_rotation_matrix(q: &Vector4<f32>) -> Matrix3<f32> {
    let (x, y, z, w) = (q.x, q.y, q.z, q.w);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y - w * z), 2.0 * (x * z + w * y),
        2.0 * (x * y + w * z), 1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z - w * x),
        2.0 * (x * z - w * y), 2.0 * (y * z + w * x), 1.0 - 2.0 * (x * x + y * y),
    )
}

/// `Σ = Mᵀ·M` with `M = S·Rᵀ`, i.e. `R·S²·Rᵀ`.
pub fn covariance_3d(scale: &Vector3<f32>, rotation: &Vector4<f32>) -> Matrix3<f32> {
    let r = quat_to_rotation_matrix(rotation);
    let m = Matrix3::from_diagonal(scale) * r.transpose();
    m.transpose() * m
}

/// Rotates a world covariance into view space using the upper 3x3 of the model-view matrix.
pub fn view_covariance(cov3d: &Matrix3<f32>, model_view: &Matrix4<f32>) -> Matrix3<f32> {
    let w: Matrix3<f32> = model_view.fixed_view::<3, 3>(0, 0).into_owned();
    w * cov3d * w.transpose()
}

pub fn projection_jacobian(view_pos: &Vector3<f32>, focal_x: f32, focal_y: f32) -> Matrix2x3<f32> {
    let depth = -view_pos.z;
    let depth2 = depth * depth;
    Matrix2x3::new(
        focal_x / depth, 0.0, -(focal_x * view_pos.x) / depth2,
        0.0, focal_y / depth, -(focal_y * view_pos.y) / depth2,
    )
}

/// `J·Σ·Jᵀ` plus the low-pass term on the diagonal.
pub fn project_covariance(
    cov_view: &Matrix3<f32>,
    view_pos: &Vector3<f32>,
    focal_x: f32,
    focal_y: f32,
) -> Matrix2<f32> {
    let j = projection_jacobian(view_pos, focal_x, focal_y);
    let mut cov2d = j * cov_view * j.transpose();
    cov2d[(0, 0)] += LOW_PASS;
    cov2d[(1, 1)] += LOW_PASS;
    cov2d
}

/// `(λ1, λ2)` with `λ1 >= λ2`; the discriminant is floored at [`DISCRIMINANT_FLOOR`].
pub fn eigenvalues_2x2(cov: &Matrix2<f32>) -> (f32, f32) {
    let det = cov.determinant();
    let mid = 0.5 * cov.trace();
    let root = (mid * mid - det).max(DISCRIMINANT_FLOOR).sqrt();
    (mid + root, mid - root)
}

/// 3-sigma footprint in pixels, never below [`MIN_RADIUS_PX`].
pub fn splat_radius(cov: &Matrix2<f32>) -> f32 {
    let (l1, l2) = eigenvalues_2x2(cov);
    (3.0 * l1.max(l2).sqrt()).ceil().max(MIN_RADIUS_PX)
}

/// Inverse covariance `(a, b, c)`; `None` when the determinant is not positive.
pub fn conic(cov: &Matrix2<f32>) -> Option<Vector3<f32>> {
    let det = cov.determinant();
    if !(det > 0.0) || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    Some(Vector3::new(cov[(1, 1)] * inv_det, -cov[(0, 1)] * inv_det, cov[(0, 0)] * inv_det))
}

/// Vertex-stage output for one splat, reused by all of its quad corners and pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectedSplat {
    pub clip_center: Vector4<f32>,
    /// Center in pixels, origin bottom-left.
    pub screen_center: Vector2<f32>,
    pub conic: Vector3<f32>,
    pub inv_det: f32,
    pub radius: f32,
    pub depth: f32,
}

impl ProjectedSplat {
    /// Billboard corner in clip space; `corner` components are `±1`.
    pub fn corner_clip_position(&self, corner: &Vector2<f32>, uniforms: &ShaderUniforms) -> [f32; 4] {
        let pixel = self.screen_center + corner * self.radius;
        let ndc = pixel.component_div(&uniforms.screen_size) * 2.0 - Vector2::new(1.0, 1.0);
        let w = self.clip_center.w;
        [ndc.x * w, ndc.y * w, self.clip_center.z, w]
    }
}

/// Runs the per-instance projection. Returns `None` for splats that must be
/// culled: behind the camera, degenerate covariance, or non-finite output.
pub fn project_splat(
    position: &Vector3<f32>,
    scale: &Vector3<f32>,
    rotation: &Vector4<f32>,
    model_view: &Matrix4<f32>,
    projection: &Matrix4<f32>,
    uniforms: &ShaderUniforms,
) -> Option<ProjectedSplat> {
    let cov3d = covariance_3d(scale, rotation);

    let view = model_view * position.push(1.0);
    let view_pos = view.xyz();
    let depth = -view_pos.z;
    if !(depth > 0.0) {
        return None;
    }

    let cov_view = view_covariance(&cov3d, model_view);
    let cov2d = project_covariance(&cov_view, &view_pos, uniforms.focal_x, uniforms.focal_y);

    let det = cov2d.determinant();
    let conic = conic(&cov2d)?;
    let radius = splat_radius(&cov2d);

    let clip = projection * view;
    if !(clip.w > 0.0) {
        return None;
    }
    let ndc = clip.xy() / clip.w;
    let screen_center = (ndc + Vector2::new(1.0, 1.0)).component_mul(&uniforms.screen_size) * 0.5;

    let finite = screen_center.iter().chain(conic.iter()).all(|v| v.is_finite()) && radius.is_finite();
    finite.then_some(ProjectedSplat {
        clip_center: clip,
        screen_center,
        conic,
        inv_det: 1.0 / det,
        radius,
        depth,
    })
}

/// Gaussian falloff at pixel offset `d` from the center, or `None` when the
/// fragment is discarded.
pub fn fragment_alpha(conic: &Vector3<f32>, d: &Vector2<f32>, opacity: f32) -> Option<f32> {
    let power = -0.5 * (conic.x * d.x * d.x + 2.0 * conic.y * d.x * d.y + conic.z * d.y * d.y);
    if power > MAX_POWER || power < MIN_POWER {
        return None;
    }
    let alpha = power.exp() * opacity;
    (alpha >= MIN_ALPHA).then_some(alpha)
}

/// Gamma-expanded, premultiplied RGBA.
pub fn shade(color: &Vector3<f32>, alpha: f32) -> Vector4<f32> {
    let linear = color.map(|c| c.max(0.0).powf(GAMMA));
    (linear * alpha).push(alpha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const IDENTITY_QUAT: Vector4<f32> = Vector4::new(0.0, 0.0, 0.0, 1.0);

    fn random_unit_quat(rng: &mut StdRng) -> Vector4<f32> {
        loop {
            let q = Vector4::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            if q.norm() > 0.1 {
                return q.normalize();
            }
        }
    }

    fn random_scale(rng: &mut StdRng) -> Vector3<f32> {
        Vector3::new(
            rng.gen_range(0.001..2.0),
            rng.gen_range(0.001..2.0),
            rng.gen_range(0.001..2.0),
        )
    }

    fn perspective(fov_deg: f32, aspect: f32) -> Matrix4<f32> {
        Matrix4::new_perspective(aspect, fov_deg.to_radians(), 0.1, 1000.0)
    }

    #[test]
    fn identity_rotation_gives_squared_scales() {
        let cov = covariance_3d(&Vector3::new(2.0, 1.0, 0.5), &IDENTITY_QUAT);
        assert_relative_eq!(cov, Matrix3::from_diagonal(&Vector3::new(4.0, 1.0, 0.25)), epsilon = 1e-6);
    }

    #[test]
    fn quarter_turn_about_z_swaps_axes() {
        let half = std::f32::consts::FRAC_PI_4;
        let q = Vector4::new(0.0, 0.0, half.sin(), half.cos());
        let cov = covariance_3d(&Vector3::new(2.0, 1.0, 1.0), &q);
        assert_relative_eq!(cov[(0, 0)], 1.0, epsilon = 1e-5);
        assert_relative_eq!(cov[(1, 1)], 4.0, epsilon = 1e-5);

        let r = quat_to_rotation_matrix(&q);
        assert_relative_eq!(r * Vector3::x(), Vector3::y(), epsilon = 1e-6);
    }

    #[test]
    fn covariance_is_symmetric_positive_semidefinite() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let cov = covariance_3d(&random_scale(&mut rng), &random_unit_quat(&mut rng));
            assert_relative_eq!(cov, cov.transpose(), epsilon = 1e-5);
            let eigen = cov.symmetric_eigen();
            let scale = cov.norm().max(1.0);
            assert!(eigen.eigenvalues.iter().all(|&l| l >= -1e-5 * scale), "{:?}", eigen.eigenvalues);
        }
    }

    #[test]
    fn eigenvalues_and_radius_of_diagonal_covariance() {
        let cov = Matrix2::new(4.0, 0.0, 0.0, 1.0);
        let (l1, l2) = eigenvalues_2x2(&cov);
        assert_relative_eq!(l1, 4.0, epsilon = 1e-6);
        assert_relative_eq!(l2, 1.0, epsilon = 1e-6);
        assert_eq!(splat_radius(&cov), 6.0);
    }

    #[test]
    fn conic_inverts_covariance() {
        let cov = Matrix2::new(4.0, 1.0, 1.0, 2.0);
        let c = conic(&cov).unwrap();
        let inverse = cov.try_inverse().unwrap();
        assert_relative_eq!(c.x, inverse[(0, 0)], epsilon = 1e-6);
        assert_relative_eq!(c.y, inverse[(0, 1)], epsilon = 1e-6);
        assert_relative_eq!(c.z, inverse[(1, 1)], epsilon = 1e-6);
    }

    #[test]
    fn non_positive_determinant_has_no_conic() {
        assert!(conic(&Matrix2::new(1.0, 2.0, 2.0, 1.0)).is_none());
        assert!(conic(&Matrix2::zeros()).is_none());
        assert!(conic(&Matrix2::new(f32::NAN, 0.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn focal_length_from_reference_fov() {
        let uniforms = ShaderUniforms::for_viewport(1280.0, 720.0);
        let expected = 360.0 / 25f32.to_radians().tan();
        assert_relative_eq!(uniforms.focal_x, expected, epsilon = 1e-3);
        assert_eq!(uniforms.focal_x, uniforms.focal_y);
        assert_eq!(uniforms.screen_size, Vector2::new(1280.0, 720.0));
    }

    #[test]
    fn tiny_distant_splat_is_clamped_to_the_minimum_footprint() {
        let uniforms = ShaderUniforms::for_viewport(800.0, 600.0);
        let projected = project_splat(
            &Vector3::new(0.0, 0.0, -100.0),
            &Vector3::new(0.01, 0.01, 0.01),
            &IDENTITY_QUAT,
            &Matrix4::identity(),
            &perspective(10.0, 800.0 / 600.0),
            &uniforms,
        )
        .unwrap();
        // Low-pass plus discriminant floor: ceil(3 * sqrt(0.3 + sqrt(0.1))) with a sub-pixel kernel.
        assert_eq!(projected.radius, 3.0);
        assert!(projected.radius >= MIN_RADIUS_PX);
        assert_relative_eq!(projected.screen_center, Vector2::new(400.0, 300.0), epsilon = 1e-3);
        assert_relative_eq!(projected.depth, 100.0);
    }

    #[test]
    fn splat_behind_camera_is_culled() {
        let uniforms = ShaderUniforms::for_viewport(640.0, 480.0);
        let projected = project_splat(
            &Vector3::new(0.0, 0.0, 5.0),
            &Vector3::new(0.1, 0.1, 0.1),
            &IDENTITY_QUAT,
            &Matrix4::identity(),
            &perspective(50.0, 4.0 / 3.0),
            &uniforms,
        );
        assert!(projected.is_none());
    }

    #[test]
    fn non_finite_inputs_are_culled() {
        let uniforms = ShaderUniforms::for_viewport(640.0, 480.0);
        let projected = project_splat(
            &Vector3::new(0.0, 0.0, -3.0),
            &Vector3::new(f32::NAN, 0.1, 0.1),
            &IDENTITY_QUAT,
            &Matrix4::identity(),
            &perspective(50.0, 4.0 / 3.0),
            &uniforms,
        );
        assert!(projected.is_none());
    }

    #[test]
    fn random_splats_project_to_finite_footprints_or_cull() {
        let mut rng = StdRng::seed_from_u64(3);
        let uniforms = ShaderUniforms::for_viewport(1024.0, 768.0);
        let projection = perspective(50.0, 1024.0 / 768.0);
        for _ in 0..1000 {
            let position = Vector3::new(
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-20.0..2.0),
            );
            let projected = project_splat(
                &position,
                &random_scale(&mut rng),
                &random_unit_quat(&mut rng),
                &Matrix4::identity(),
                &projection,
                &uniforms,
            );
            if let Some(p) = projected {
                assert!(p.radius >= MIN_RADIUS_PX);
                assert!(p.inv_det > 0.0 && p.inv_det.is_finite());
                for corner in [Vector2::new(-1.0, 1.0), Vector2::new(1.0, -1.0)] {
                    let clip = p.corner_clip_position(&corner, &uniforms);
                    assert!(clip.iter().all(|v| v.is_finite()));
                }
            }
        }
    }

    #[test]
    fn corners_offset_by_radius_in_pixels() {
        let uniforms = ShaderUniforms::for_viewport(200.0, 100.0);
        let splat = ProjectedSplat {
            clip_center: Vector4::new(0.0, 0.0, 0.5, 2.0),
            screen_center: Vector2::new(100.0, 50.0),
            conic: Vector3::new(1.0, 0.0, 1.0),
            inv_det: 1.0,
            radius: 10.0,
            depth: 2.0,
        };
        let clip = splat.corner_clip_position(&Vector2::new(1.0, -1.0), &uniforms);
        // 10px right of center is ndc 0.1, 10px down is ndc -0.2; both scaled back by w.
        assert_relative_eq!(clip[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(clip[1], -0.4, epsilon = 1e-6);
        assert_eq!(clip[2], 0.5);
        assert_eq!(clip[3], 2.0);
    }

    #[test]
    fn fragment_thresholds() {
        let conic = Vector3::new(1.0, 0.0, 1.0);
        assert_relative_eq!(fragment_alpha(&conic, &Vector2::zeros(), 0.8).unwrap(), 0.8);
        // power = -0.5 * 9 = -4.5 is below the cutoff.
        assert!(fragment_alpha(&conic, &Vector2::new(3.0, 0.0), 1.0).is_none());
        // exp(-2) * 0.05 is under the alpha threshold.
        assert!(fragment_alpha(&conic, &Vector2::new(2.0, 0.0), 0.05).is_none());
        // A negative-definite conic gives positive power.
        assert!(fragment_alpha(&-conic, &Vector2::new(1.0, 0.0), 1.0).is_none());
    }

    #[test]
    fn shading_is_gamma_expanded_and_premultiplied() {
        let out = shade(&Vector3::new(0.5, 1.0, 0.0), 0.5);
        assert_relative_eq!(out.x, 0.5f32.powf(2.2) * 0.5, epsilon = 1e-6);
        assert_relative_eq!(out.y, 0.5, epsilon = 1e-6);
        assert_eq!(out.z, 0.0);
        assert_eq!(out.w, 0.5);
    }
}
