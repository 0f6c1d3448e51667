//! Viewer controller: owns the camera, the active asset and the background
//! loads that replace it.
//!
//! Loads run on the tokio runtime and report back over a channel tagged with
//! the token handed out by [`ViewerController::load`]. Only the outcome whose
//! token matches the most recent request is ever applied, so a slow early
//! load can never overwrite a later one. A superseded load is also told to
//! stop: its async part is aborted and its blocking decode sees a cancelled
//! [`CancellationToken`] at the next stage boundary.

use std::sync::Arc;
use std::time::Duration;

use nalgebra as na;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bounds::Bounds;
use crate::camera::Camera;
use crate::decoder::{self, RawAsset};
use crate::error::{AssetError, AssetResult};
use crate::fetch::{self, AssetFetcher, AssetSource, DEFAULT_FETCH_TIMEOUT};
use crate::gaussians::{self, DEFAULT_MAX_SPLATS};
use crate::pipelines::{self, FrameBuffers, GaussianSplatPipeline, MeshPipeline};
use crate::ply::{self, ParsedGeometry, PlyParsePolicy};
use crate::projection::ShaderUniforms;
use crate::splat_buffer::SplatRenderBuffer;

/// Largest extent a loaded model is scaled to.
pub const FIT_SIZE: f32 = 4.0;
/// Auto-rotation speed about the vertical axis, rad/s.
pub const AUTO_ROTATE_SPEED: f32 = 0.5;
/// Orbit sensitivity, rad per dragged pixel.
pub const DRAG_SPEED: f32 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    pub max_splats: usize,
    pub policy: PlyParsePolicy,
    pub fetch_timeout: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_splats: DEFAULT_MAX_SPLATS,
            policy: PlyParsePolicy::default(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Render state for whatever is on screen.
#[derive(Debug)]
pub enum ActiveAsset {
    Splats(SplatRenderBuffer),
    Mesh(ParsedGeometry),
}

#[derive(Debug)]
pub struct LoadedAsset {
    pub name: String,
    pub asset: ActiveAsset,
    pub bounds: Bounds,
}

impl LoadedAsset {
    fn is_empty(&self) -> bool {
        match &self.asset {
            ActiveAsset::Splats(buffer) => buffer.attributes().is_empty(),
            ActiveAsset::Mesh(geometry) => geometry.vertex_count == 0,
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> AssetResult<()> {
    if cancel.is_cancelled() {
        return Err(AssetError::Cancelled);
    }
    Ok(())
}

/// Decodes raw bytes and builds render state, picking the splat or the mesh
/// path from the PLY header. Returns [`AssetError::Cancelled`] once `cancel`
/// fires.
#[instrument(skip_all, fields(name = %raw.name))]
pub fn load_asset(raw: RawAsset, options: &LoadOptions, cancel: &CancellationToken) -> AssetResult<LoadedAsset> {
    ensure_live(cancel)?;
    let doc = decoder::decode(raw)?;
    ensure_live(cancel)?;
    let header = ply::scan_header(&doc.bytes)?;
    if header.is_splat() {
        let splats = gaussians::load_splats(&doc, options.max_splats)?;
        ensure_live(cancel)?;
        let bounds = splats.bounds;
        Ok(LoadedAsset {
            name: doc.name,
            asset: ActiveAsset::Splats(SplatRenderBuffer::new(splats)),
            bounds,
        })
    } else {
        let geometry = ply::parse_cancellable(&doc, options.policy, cancel)?;
        Ok(LoadedAsset {
            name: doc.name,
            bounds: geometry.bounds,
            asset: ActiveAsset::Mesh(geometry),
        })
    }
}

/// Fetch, then decode and build off the async workers.
pub async fn fetch_and_load(
    fetcher: Arc<dyn AssetFetcher>,
    source: AssetSource,
    options: LoadOptions,
    cancel: CancellationToken,
) -> AssetResult<LoadedAsset> {
    let raw = tokio::select! {
        raw = fetch::fetch_raw(fetcher.as_ref(), &source, options.fetch_timeout) => raw?,
        _ = cancel.cancelled() => return Err(AssetError::Cancelled),
    };
    tokio::task::spawn_blocking(move || load_asset(raw, &options, &cancel)).await?
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub token: u64,
    pub result: AssetResult<LoadedAsset>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ViewerStatus {
    Idle,
    Loading { token: u64 },
    Ready { name: String },
    Failed { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InputEvent {
    Drag { dx: f32, dy: f32 },
    Wheel { delta: f32 },
    Click,
}

/// A background load and the token that stops it.
struct InFlight {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl InFlight {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

pub struct ViewerController {
    runtime: Handle,
    fetcher: Arc<dyn AssetFetcher>,
    options: LoadOptions,
    latest_token: u64,
    in_flight: Option<InFlight>,
    outcome_tx: UnboundedSender<LoadOutcome>,
    outcome_rx: UnboundedReceiver<LoadOutcome>,
    active: Option<LoadedAsset>,
    status: ViewerStatus,
    camera: Camera,
    auto_rotate: bool,
    model_yaw: f32,
    uniforms: ShaderUniforms,
    frame: FrameBuffers,
    placeholder: ParsedGeometry,
    closed: bool,
}

impl ViewerController {
    pub fn new(
        runtime: Handle,
        fetcher: Arc<dyn AssetFetcher>,
        options: LoadOptions,
        width: usize,
        height: usize,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            fetcher,
            options,
            latest_token: 0,
            in_flight: None,
            outcome_tx,
            outcome_rx,
            active: None,
            status: ViewerStatus::Idle,
            camera: Camera::new(height as f32, width as f32),
            auto_rotate: true,
            model_yaw: 0.0,
            uniforms: ShaderUniforms::for_viewport(width as f32, height as f32),
            frame: FrameBuffers::new(width, height),
            placeholder: pipelines::placeholder_cube(),
            closed: false,
        }
    }

    /// Starts loading `source` and returns its token. Any load still in
    /// flight is aborted and its outcome will be ignored.
    pub fn load(&mut self, source: AssetSource) -> u64 {
        if self.closed {
            return self.latest_token;
        }
        self.latest_token += 1;
        let token = self.latest_token;
        if let Some(previous) = self.in_flight.take() {
            debug!("Load {} supersedes the one in flight", token);
            previous.stop();
        }

        info!("Loading {} (token {})", source.name(), token);
        let fetcher = Arc::clone(&self.fetcher);
        let options = self.options;
        let tx = self.outcome_tx.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = self.runtime.spawn(async move {
            let result = fetch_and_load(fetcher, source, options, task_cancel).await;
            // The receiver is gone once the controller closes
            let _ = tx.send(LoadOutcome { token, result });
        });
        self.in_flight = Some(InFlight { task, cancel });
        self.status = ViewerStatus::Loading { token };
        token
    }

    /// Applies finished loads. Called once per frame; returns `true` when the
    /// displayed state changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            changed |= self.apply_outcome(outcome);
        }
        changed
    }

    pub fn apply_outcome(&mut self, outcome: LoadOutcome) -> bool {
        if outcome.token != self.latest_token {
            debug!("Dropping stale load {} (latest is {})", outcome.token, self.latest_token);
            return false;
        }
        self.in_flight = None;
        match outcome.result {
            Ok(asset) => {
                info!("Showing {}", asset.name);
                self.status = ViewerStatus::Ready { name: asset.name.clone() };
                self.active = Some(asset);
                self.model_yaw = 0.0;
            }
            Err(err) => {
                warn!("Load {} failed: {}", outcome.token, err);
                self.status = ViewerStatus::Failed { message: err.to_string() };
            }
        }
        true
    }

    pub fn status(&self) -> &ViewerStatus {
        &self.status
    }

    pub fn latest_token(&self) -> u64 {
        self.latest_token
    }

    pub fn active(&self) -> Option<&LoadedAsset> {
        self.active.as_ref()
    }

    /// "No model" and "load failed" look the same on screen.
    pub fn shows_placeholder(&self) -> bool {
        self.active.as_ref().map_or(true, LoadedAsset::is_empty)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn auto_rotate(&self) -> bool {
        self.auto_rotate
    }

    pub fn set_auto_rotate(&mut self, enabled: bool) {
        self.auto_rotate = enabled;
    }

    pub fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::Drag { dx, dy } => self.camera.orbit(-dx * DRAG_SPEED, dy * DRAG_SPEED),
            InputEvent::Wheel { delta } if delta > 0.0 => self.camera.dolly_in(),
            InputEvent::Wheel { delta } if delta < 0.0 => self.camera.dolly_out(),
            InputEvent::Wheel { .. } => {}
            InputEvent::Click => self.auto_rotate = !self.auto_rotate,
        }
    }

    /// Advances auto-rotation by `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        if self.auto_rotate && dt.is_finite() && dt > 0.0 {
            self.model_yaw = (self.model_yaw + AUTO_ROTATE_SPEED * dt) % std::f32::consts::TAU;
        }
    }

    pub fn model_yaw(&self) -> f32 {
        self.model_yaw
    }

    pub fn reset(&mut self) {
        self.camera.reset();
        self.model_yaw = 0.0;
    }

    pub fn zoom_in(&mut self) {
        self.camera.dolly_in();
    }

    pub fn zoom_out(&mut self) {
        self.camera.dolly_out();
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        if width == self.frame.width() && height == self.frame.height() {
            return;
        }
        self.camera.update_resolution(height as f32, width as f32);
        self.uniforms = ShaderUniforms::for_viewport(width as f32, height as f32);
        self.frame = FrameBuffers::new(width, height);
    }

    pub fn uniforms(&self) -> &ShaderUniforms {
        &self.uniforms
    }

    /// Rotation about Y, then the fit-to-size scale, around the asset center.
    pub fn model_matrix(&self) -> na::Matrix4<f32> {
        let rotation = na::Matrix4::from_axis_angle(&na::Vector3::y_axis(), self.model_yaw);
        match self.active.as_ref().filter(|a| !a.is_empty()) {
            Some(asset) => {
                let extent = asset.bounds.max_extent();
                let scale = if extent > 0.0 && extent.is_finite() { FIT_SIZE / extent } else { 1.0 };
                rotation
                    * na::Matrix4::new_scaling(scale)
                    * na::Matrix4::new_translation(&-asset.bounds.center())
            }
            None => rotation,
        }
    }

    /// Rasterizes the current state into the frame buffer.
    pub fn render(&mut self) -> &FrameBuffers {
        self.camera.compute_matrices();
        self.frame.clear();
        if self.closed {
            return &self.frame;
        }

        let model = self.model_matrix();
        let view = *self.camera.get_view_matrix();
        let projection = *self.camera.get_project_matrix();
        match self.active.as_ref().filter(|a| !a.is_empty()).map(|a| &a.asset) {
            Some(ActiveAsset::Splats(buffer)) => {
                GaussianSplatPipeline::prepare(buffer.attributes(), &(view * model), &projection, self.uniforms)
                    .render_to_buffer(&mut self.frame);
            }
            Some(ActiveAsset::Mesh(geometry)) => {
                MeshPipeline::prepare(geometry, &model, &view, &projection, &self.uniforms)
                    .render_to_buffer(&mut self.frame);
            }
            None => {
                MeshPipeline::prepare(&self.placeholder, &model, &view, &projection, &self.uniforms)
                    .render_to_buffer(&mut self.frame);
            }
        }
        &self.frame
    }

    pub fn frame(&self) -> &FrameBuffers {
        &self.frame
    }

    /// Stops background work and releases render state. Later loads are ignored.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(load) = self.in_flight.take() {
            load.stop();
        }
        self.outcome_rx.close();
        self.active = None;
        self.frame = FrameBuffers::new(0, 0);
        self.status = ViewerStatus::Idle;
        info!("Viewer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ViewerController {
    fn drop(&mut self) {
        if let Some(load) = self.in_flight.take() {
            load.stop();
        }
    }
}
