use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use minifb::{Key, KeyRepeat, MouseButton, MouseMode, Window, WindowOptions};
use tracing::{debug, info, instrument, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, Layer};

use menu_splat::config::ViewerConfig;
use menu_splat::fetch::{AssetSource, SourceFetcher};
use menu_splat::viewer::{InputEvent, ViewerController};

/// Mouse travel below which a press and release counts as a click.
const CLICK_SLOP_PX: f32 = 3.0;

/// Tracks the left button between frames to tell drags from clicks.
#[derive(Default)]
struct PointerState {
    last: Option<(f32, f32)>,
    travelled: f32,
}

impl PointerState {
    fn update(&mut self, window: &Window, events: &mut Vec<InputEvent>) {
        let down = window.get_mouse_down(MouseButton::Left);
        let pos = window.get_mouse_pos(MouseMode::Pass);
        match (down, self.last, pos) {
            (true, Some((lx, ly)), Some((x, y))) => {
                let (dx, dy) = (x - lx, y - ly);
                if dx != 0.0 || dy != 0.0 {
                    self.travelled += dx.abs() + dy.abs();
                    events.push(InputEvent::Drag { dx, dy });
                }
                self.last = Some((x, y));
            }
            (true, None, Some(p)) => {
                self.last = Some(p);
                self.travelled = 0.0;
            }
            (false, Some(_), _) => {
                if self.travelled < CLICK_SLOP_PX {
                    events.push(InputEvent::Click);
                }
                self.last = None;
            }
            _ => {}
        }
        if let Some((_, scroll_y)) = window.get_scroll_wheel() {
            if scroll_y != 0.0 {
                events.push(InputEvent::Wheel { delta: scroll_y });
            }
        }
    }
}

#[instrument(skip_all)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = ViewerConfig::parse();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(LevelFilter::from(config.log_level));
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("menu-splat-loader")
        .enable_all()
        .build()?;

    let fetcher = Arc::new(SourceFetcher::new(config.fetch_timeout())?);
    let (mut width, mut height) = (config.width, config.height);
    let mut viewer = ViewerController::new(
        runtime.handle().clone(),
        fetcher,
        config.load_options(),
        width,
        height,
    );
    viewer.set_auto_rotate(!config.no_auto_rotate);
    if let Some(model) = &config.model {
        viewer.load(AssetSource::parse(model));
    }

    let mut window = Window::new(
        "menu-splat",
        width,
        height,
        WindowOptions {
            resize: true,
            ..WindowOptions::default()
        },
    )?;
    window.limit_update_rate(Some(Duration::from_micros(16_600)));

    let mut pointer = PointerState::default();
    let mut events = Vec::new();
    let mut pixels = Vec::with_capacity(width * height);
    let mut last_frame = Instant::now();

    while window.is_open() && !window.is_key_down(Key::Escape) {
        let now = Instant::now();
        let dt = now.duration_since(last_frame).as_secs_f32();
        last_frame = now;

        let (w, h) = window.get_size();
        if (w, h) != (width, height) && w > 0 && h > 0 {
            debug!("Resized to {}x{}", w, h);
            (width, height) = (w, h);
            viewer.resize(width, height);
        }

        pointer.update(&window, &mut events);
        for event in events.drain(..) {
            viewer.handle_input(event);
        }
        if window.is_key_pressed(Key::R, KeyRepeat::No) {
            viewer.reset();
        }
        if window.is_key_pressed(Key::Equal, KeyRepeat::Yes) || window.is_key_pressed(Key::NumPadPlus, KeyRepeat::Yes) {
            viewer.zoom_in();
        }
        if window.is_key_pressed(Key::Minus, KeyRepeat::Yes) || window.is_key_pressed(Key::NumPadMinus, KeyRepeat::Yes) {
            viewer.zoom_out();
        }
        if window.is_key_pressed(Key::Space, KeyRepeat::No) {
            viewer.handle_input(InputEvent::Click);
        }

        if viewer.poll() {
            window.set_title(&format!("menu-splat - {:?}", viewer.status()));
        }
        viewer.tick(dt);
        viewer.render().to_argb(&mut pixels);
        window.update_with_buffer(&pixels, width, height)?;
    }

    viewer.close();
    info!("Bye");
    Ok(())
}
