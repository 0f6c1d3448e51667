use nalgebra as na;
use nalgebra_glm as glm;

pub const FOVY_DEG: f32 = 50.0;
pub const ZNEAR: f32 = 0.1;
pub const ZFAR: f32 = 1000.0;
pub const START_DISTANCE: f32 = 5.0;
pub const MIN_DISTANCE: f32 = 2.0;
pub const MAX_DISTANCE: f32 = 10.0;
/// Multiplier applied to the orbit distance per zoom step.
pub const DOLLY_FACTOR: f32 = 0.8;
pub const MIN_PITCH: f32 = -0.1745;
pub const MAX_PITCH: f32 = 1.55;

/// Orbit camera looking at a fixed pivot, Y up.
#[derive(Clone, Debug)]
pub struct Camera {
    znear: f32,
    zfar: f32,
    pub h: f32,
    pub w: f32,
    fovy: f32,
    pub position: na::Vector3<f32>,
    target: na::Vector3<f32>,
    up: na::Vector3<f32>,
    distance: f32,
    yaw: f32,
    pitch: f32,
    pub is_pose_dirty: bool,
    is_intrin_dirty: bool,
    view_matrix: na::Matrix4<f32>,
    projection_matrix: na::Matrix4<f32>,
}

impl Camera {
    pub fn new(h: f32, w: f32) -> Self {
        let mut camera = Self {
            znear: ZNEAR,
            zfar: ZFAR,
            h,
            w,
            fovy: FOVY_DEG.to_radians(),
            position: na::Vector3::new(0.0, 0.0, START_DISTANCE),
            target: na::Vector3::zeros(),
            up: na::Vector3::y(),
            distance: START_DISTANCE,
            yaw: 0.0,
            pitch: 0.0,
            is_pose_dirty: true,
            is_intrin_dirty: true,
            view_matrix: na::Matrix4::identity(),
            projection_matrix: na::Matrix4::identity(),
        };
        camera.compute_matrices();
        camera
    }

    /// Recomputes whichever matrices are stale.
    pub fn compute_matrices(&mut self) {
        if self.is_pose_dirty {
            // Spherical offset from the pivot: yaw about Y, pitch towards +Y
            let offset = na::Vector3::new(
                self.distance * self.pitch.cos() * self.yaw.sin(),
                self.distance * self.pitch.sin(),
                self.distance * self.pitch.cos() * self.yaw.cos(),
            );
            self.position = self.target + offset;
            self.view_matrix = glm::look_at(&self.position, &self.target, &self.up);
            self.is_pose_dirty = false;
        }
        if self.is_intrin_dirty {
            self.projection_matrix = glm::perspective(self.w / self.h, self.fovy, self.znear, self.zfar);
            self.is_intrin_dirty = false;
        }
    }

    pub fn get_view_matrix(&self) -> &na::Matrix4<f32> {
        &self.view_matrix
    }

    pub fn get_project_matrix(&self) -> &na::Matrix4<f32> {
        &self.projection_matrix
    }

    pub fn update_resolution(&mut self, height: f32, width: f32) {
        self.h = height.max(1.0);
        self.w = width.max(1.0);
        self.is_intrin_dirty = true;
    }

    pub fn get_focal(&self) -> f32 {
        self.h / (2.0 * (self.fovy / 2.0).tan())
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn update_pitch_angle(&mut self, delta: f32) {
        self.pitch = (self.pitch + delta).clamp(MIN_PITCH, MAX_PITCH);
        self.is_pose_dirty = true;
    }

    pub fn update_yaw_angle(&mut self, delta: f32) {
        self.yaw = (self.yaw + delta) % std::f32::consts::TAU;
        self.is_pose_dirty = true;
    }

    pub fn orbit(&mut self, delta_yaw: f32, delta_pitch: f32) {
        self.update_yaw_angle(delta_yaw);
        self.update_pitch_angle(delta_pitch);
    }

    /// Scales the orbit distance, clamped to `[MIN_DISTANCE, MAX_DISTANCE]`.
    pub fn dolly(&mut self, factor: f32) {
        if !(factor > 0.0) || !factor.is_finite() {
            return;
        }
        self.distance = (self.distance * factor).clamp(MIN_DISTANCE, MAX_DISTANCE);
        self.is_pose_dirty = true;
    }

    pub fn dolly_in(&mut self) {
        self.dolly(DOLLY_FACTOR);
    }

    pub fn dolly_out(&mut self) {
        self.dolly(1.0 / DOLLY_FACTOR);
    }

    pub fn reset(&mut self) {
        self.distance = START_DISTANCE;
        self.yaw = 0.0;
        self.pitch = 0.0;
        self.is_pose_dirty = true;
    }
}
