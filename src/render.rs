//! Render loop: drains input, applies edits, warps the current media frame
//! and presents it on the active display surface once per tick.

use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut, draw_line_segment_mut};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, OverlayConfig, Point, Rect};
use crate::interaction::{InteractionController, PointerEvent};
use crate::media::{MediaSource, Playlist, SourceFrame};
use crate::preset::{Preset, PresetStore};
use crate::quad::Quad;
use crate::warp::{OutputFrame, WarpEngine, WarpError};

const EDGE_COLOR: Rgb<u8> = Rgb([0, 200, 255]);
const HANDLE_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const ACTIVE_HANDLE_COLOR: Rgb<u8> = Rgb([255, 180, 0]);
const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Which surface the output goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Windowed editor with handles and clamped dragging
    Editor,
    /// Borderless projector output, no overlay
    Fullscreen,
}

/// Input delivered by the display surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Pointer(PointerEvent),
    ToggleFullscreen,
    /// Leaves fullscreen, or quits from the editor
    Escape,
    ResetQuad,
    ToggleMesh,
    ToggleLiveWarp,
    SavePreset,
    LoadPreset,
    NextMedia,
    Quit,
}

/// A window (or window pair) that frames are presented on
pub trait DisplaySurface {
    /// Events that arrived since the last poll, in order
    fn poll_events(&mut self) -> Vec<InputEvent>;

    /// Show `frame`; the surface takes ownership
    fn present(&mut self, frame: OutputFrame) -> Result<()>;

    /// Pixel size of the surface used in `mode`
    fn surface_size(&self, mode: Mode) -> (u32, u32);

    /// Switch output between editor and projector
    fn set_mode(&mut self, mode: Mode) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Rolling frame statistics, logged periodically
struct FrameStats {
    frames: u64,
    degenerate_frames: u64,
    warp_time: Duration,
    since: Instant,
}

impl FrameStats {
    fn new() -> Self {
        Self {
            frames: 0,
            degenerate_frames: 0,
            warp_time: Duration::ZERO,
            since: Instant::now(),
        }
    }

    fn record(&mut self, warp_time: Duration, degenerate: bool, solves: u64) {
        self.frames += 1;
        self.warp_time += warp_time;
        if degenerate {
            self.degenerate_frames += 1;
        }

        let elapsed = self.since.elapsed();
        if elapsed >= STATS_INTERVAL {
            let secs = elapsed.as_secs_f64();
            let avg_warp_ms = self.warp_time.as_secs_f64() * 1000.0 / self.frames.max(1) as f64;
            info!(
                "Performance: {:.1} fps ({} frames in {:.1}s, warp {:.2}ms avg, {} degenerate, {} solves total)",
                self.frames as f64 / secs,
                self.frames,
                secs,
                avg_warp_ms,
                self.degenerate_frames,
                solves
            );
            *self = Self::new();
        }
    }
}

/// Owns the editing state and drives one frame per tick
pub struct RenderLoop<D: DisplaySurface> {
    display: D,
    media: Box<dyn MediaSource>,
    playlist: Option<Playlist>,
    quad: Quad,
    controller: InteractionController,
    engine: WarpEngine,
    presets: PresetStore,
    preset_name: String,
    overlay: OverlayConfig,
    frame_interval: Duration,
    mode: Mode,
    pending_mode: Option<Mode>,
    /// Inside a run of frames where the quad could not be solved
    degenerate: bool,
    quit: bool,
    stats: FrameStats,
}

impl<D: DisplaySurface> RenderLoop<D> {
    /// Start in editor mode with the quad covering the editor surface
    pub fn new(display: D, media: Box<dyn MediaSource>, config: &Config) -> Self {
        let quad = Quad::from_rect(Rect::from_size(
            config.display.editor_width,
            config.display.editor_height,
        ));
        Self {
            display,
            media,
            playlist: None,
            quad,
            controller: InteractionController::new(config.interaction.hit_radius),
            engine: WarpEngine::new(Rgb(config.display.background)),
            presets: PresetStore::new(config.presets.directory.clone()),
            preset_name: config.presets.default_name.clone(),
            overlay: config.overlay.clone(),
            frame_interval: config.frame_interval(),
            mode: Mode::Editor,
            pending_mode: None,
            degenerate: false,
            quit: false,
            stats: FrameStats::new(),
        }
    }

    pub fn with_playlist(mut self, playlist: Playlist) -> Self {
        self.playlist = Some(playlist);
        self
    }

    #[cfg(test)]
    pub fn quad(&self) -> &Quad {
        &self.quad
    }

    pub fn quad_mut(&mut self) -> &mut Quad {
        &mut self.quad
    }

    #[cfg(test)]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[cfg(test)]
    pub fn display(&self) -> &D {
        &self.display
    }

    /// Request a mode switch; it takes effect at the next frame boundary
    pub fn request_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            self.pending_mode = Some(mode);
        }
    }

    /// Tick until the display closes or a quit is requested
    pub fn run(&mut self) {
        info!(
            "Render loop started ({:.1} fps target, source {})",
            1.0 / self.frame_interval.as_secs_f64(),
            self.media.describe()
        );

        loop {
            let deadline = Instant::now() + self.frame_interval;
            if !self.tick() {
                break;
            }
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            }
        }

        info!("Render loop stopped");
    }

    /// One frame: events, pending mode switch, fetch, warp, overlay, present.
    /// Returns false once the loop should stop.
    pub fn tick(&mut self) -> bool {
        for event in self.display.poll_events() {
            self.handle_event(event);
        }

        if let Some(mode) = self.pending_mode.take() {
            self.apply_mode(mode);
        }

        if self.quit || !self.display.is_open() {
            return false;
        }

        let frame = self.media.next_frame();
        let surface = self.display.surface_size(self.mode);

        let warp_start = Instant::now();
        let mut output = self.render(&frame, surface);
        let warp_time = warp_start.elapsed();

        if self.mode == Mode::Editor && self.overlay.show_mesh {
            draw_overlay(
                output.image_mut(),
                &self.quad,
                self.controller.active_corner(),
                self.overlay.handle_radius,
            );
        }

        if let Err(e) = self.display.present(output) {
            warn!("Failed to present frame: {}", e);
        }

        self.stats
            .record(warp_time, self.degenerate, self.engine.solve_count());
        true
    }

    fn render(&mut self, frame: &SourceFrame, surface: (u32, u32)) -> OutputFrame {
        if !self.overlay.live_warp {
            return self.engine.letterbox(frame.image(), surface);
        }

        match self.engine.render(&self.quad, frame.image(), surface) {
            Ok(output) => {
                if self.degenerate {
                    info!("Quad is valid again");
                    self.degenerate = false;
                }
                output
            }
            Err(WarpError::DegenerateQuad) => {
                if !self.degenerate {
                    warn!("Quad is degenerate, holding the last valid mapping");
                    self.degenerate = true;
                }
                self.engine
                    .render_last_valid(frame.image(), surface)
                    .unwrap_or_else(|| self.engine.background_frame(surface))
            }
        }
    }

    fn handle_event(&mut self, event: InputEvent) {
        match event {
            InputEvent::Pointer(pointer) => {
                let clamp_to = match self.mode {
                    Mode::Editor => {
                        let (w, h) = self.display.surface_size(Mode::Editor);
                        Some(Rect::from_size(w, h))
                    }
                    Mode::Fullscreen => None,
                };
                self.controller.handle(pointer, &mut self.quad, clamp_to);
            }
            InputEvent::ToggleFullscreen => {
                let target = match self.mode {
                    Mode::Editor => Mode::Fullscreen,
                    Mode::Fullscreen => Mode::Editor,
                };
                self.request_mode(target);
            }
            InputEvent::Escape => match self.mode {
                Mode::Fullscreen => self.request_mode(Mode::Editor),
                Mode::Editor => self.quit = true,
            },
            InputEvent::ResetQuad => {
                let (w, h) = self.display.surface_size(self.mode);
                self.quad
                    .reset(Rect::from_size(w, h).inset(self.overlay.reset_margin));
                info!("Quad reset to {}x{} surface", w, h);
            }
            InputEvent::ToggleMesh => {
                self.overlay.show_mesh = !self.overlay.show_mesh;
                debug!("Mesh overlay {}", if self.overlay.show_mesh { "on" } else { "off" });
            }
            InputEvent::ToggleLiveWarp => {
                self.overlay.live_warp = !self.overlay.live_warp;
                info!("Live warp {}", if self.overlay.live_warp { "on" } else { "off" });
            }
            InputEvent::SavePreset => {
                let preset = Preset::from_quad(self.preset_name.clone(), &self.quad);
                if let Err(e) = self.presets.save(&self.preset_name, &preset) {
                    warn!("Failed to save preset: {}", e);
                }
            }
            InputEvent::LoadPreset => {
                match self.presets.load_into(&self.preset_name, &mut self.quad) {
                    Ok(_) => {
                        let bounds = self.quad.bounding_box();
                        debug!(
                            "Quad now spans {:.0}x{:.0} at ({:.0}, {:.0})",
                            bounds.width, bounds.height, bounds.x, bounds.y
                        );
                    }
                    Err(e) => warn!("Failed to load preset: {}", e),
                }
            }
            InputEvent::NextMedia => {
                if let Some(media) = self.playlist.as_mut().and_then(Playlist::advance) {
                    info!("Switched media to {}", media.describe());
                    self.media = media;
                }
            }
            InputEvent::Quit => self.quit = true,
        }
    }

    fn apply_mode(&mut self, mode: Mode) {
        // Pointer capture does not survive a surface change
        self.controller
            .handle(PointerEvent::FocusLost, &mut self.quad, None);

        match self.display.set_mode(mode) {
            Ok(()) => {
                info!("Switched to {:?} mode", mode);
                self.mode = mode;
            }
            Err(e) => warn!("Failed to switch to {:?} mode: {}", mode, e),
        }
    }
}

/// Quad edges plus a marker per corner; the dragged corner is highlighted.
///
/// Corners may lie far outside the image, so edges are clipped to it before
/// rasterizing and markers whose disc cannot touch it are skipped.
fn draw_overlay(image: &mut RgbImage, quad: &Quad, active: Option<usize>, radius: u32) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let bounds = Rect::new(0.0, 0.0, (width - 1) as f64, (height - 1) as f64);

    let handles = quad.handles();
    for i in 0..4 {
        let (_, a) = handles[i];
        let (_, b) = handles[(i + 1) % 4];
        if let Some((a, b)) = clip_segment(a, b, bounds) {
            draw_line_segment_mut(
                image,
                (a.x as f32, a.y as f32),
                (b.x as f32, b.y as f32),
                EDGE_COLOR,
            );
        }
    }

    let reach = radius as f64 + 1.0;
    for (i, (_, corner)) in handles.iter().enumerate() {
        let visible = corner.x >= -reach
            && corner.y >= -reach
            && corner.x <= width as f64 + reach
            && corner.y <= height as f64 + reach;
        if !visible {
            continue;
        }
        let center = (corner.x.round() as i32, corner.y.round() as i32);
        let fill = if active == Some(i) {
            ACTIVE_HANDLE_COLOR
        } else {
            HANDLE_COLOR
        };
        draw_filled_circle_mut(image, center, radius as i32, fill);
        draw_hollow_circle_mut(image, center, radius as i32, OUTLINE_COLOR);
    }
}

/// Liang-Barsky clip of the segment `a`-`b` to `bounds` (edges inclusive).
/// `None` when no part of the segment lies inside.
fn clip_segment(a: Point, b: Point, bounds: Rect) -> Option<(Point, Point)> {
    if ![a.x, a.y, b.x, b.y].iter().all(|v| v.is_finite()) {
        return None;
    }

    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let checks = [
        (-dx, a.x - bounds.x),
        (dx, bounds.x + bounds.width - a.x),
        (-dy, a.y - bounds.y),
        (dy, bounds.y + bounds.height - a.y),
    ];

    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                t0 = t0.max(r);
            } else {
                if r < t0 {
                    return None;
                }
                t1 = t1.min(r);
            }
        }
    }

    Some((
        Point::new(a.x + t0 * dx, a.y + t0 * dy),
        Point::new(a.x + t1 * dx, a.y + t1 * dy),
    ))
}
