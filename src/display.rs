//! minifb windows: the editor window and the borderless projector window

use anyhow::{anyhow, Result};
use minifb::{Key, KeyRepeat, MouseButton, MouseMode, Window, WindowOptions};
use tracing::{debug, info};

use crate::config::{DisplayConfig, Point};
use crate::interaction::PointerEvent;
use crate::render::{DisplaySurface, InputEvent, Mode};
use crate::warp::OutputFrame;

/// Keys mapped to loop commands, checked once per poll
const KEY_BINDINGS: [(Key, InputEvent); 8] = [
    (Key::F, InputEvent::ToggleFullscreen),
    (Key::Escape, InputEvent::Escape),
    (Key::R, InputEvent::ResetQuad),
    (Key::M, InputEvent::ToggleMesh),
    (Key::W, InputEvent::ToggleLiveWarp),
    (Key::S, InputEvent::SavePreset),
    (Key::L, InputEvent::LoadPreset),
    (Key::Tab, InputEvent::NextMedia),
];

/// Edge-detects raw mouse state into pointer events
#[derive(Debug, Default)]
struct PointerTracker {
    down: bool,
    position: Option<(f32, f32)>,
    active: bool,
}

impl PointerTracker {
    fn update(
        &mut self,
        position: Option<(f32, f32)>,
        down: bool,
        active: bool,
        events: &mut Vec<InputEvent>,
    ) {
        if self.active && !active {
            events.push(InputEvent::Pointer(PointerEvent::FocusLost));
            self.down = false;
        }
        self.active = active;

        if let Some((x, y)) = position {
            let point = Point::new(x as f64, y as f64);
            if self.position != position {
                events.push(InputEvent::Pointer(PointerEvent::Move(point)));
            }
            if down && !self.down {
                events.push(InputEvent::Pointer(PointerEvent::Down(point)));
            } else if !down && self.down {
                events.push(InputEvent::Pointer(PointerEvent::Up(point)));
            }
            self.position = position;
            // Button state only counts once there is a position to report it at
            self.down = down;
        }
    }
}

/// Editor window plus an on-demand projector window
pub struct MinifbSurface {
    config: DisplayConfig,
    editor: Window,
    projector: Option<Window>,
    pointer: PointerTracker,
    buffer: Vec<u32>,
}

impl MinifbSurface {
    pub fn new(config: &DisplayConfig) -> Result<Self> {
        let editor = Window::new(
            &config.title,
            config.editor_width as usize,
            config.editor_height as usize,
            WindowOptions::default(),
        )
        .map_err(|e| anyhow!("Failed to open editor window: {}", e))?;

        info!(
            "Editor window {}x{}",
            config.editor_width, config.editor_height
        );

        Ok(Self {
            config: config.clone(),
            editor,
            projector: None,
            pointer: PointerTracker::default(),
            buffer: Vec::new(),
        })
    }

    fn open_projector(&self) -> Result<Window> {
        let mut window = Window::new(
            &format!("{} - projector", self.config.title),
            self.config.projector_width as usize,
            self.config.projector_height as usize,
            WindowOptions {
                borderless: true,
                title: false,
                topmost: true,
                ..WindowOptions::default()
            },
        )
        .map_err(|e| anyhow!("Failed to open projector window: {}", e))?;

        window.set_position(self.config.projector_x as isize, self.config.projector_y as isize);
        info!(
            "Projector window {}x{} at ({}, {})",
            self.config.projector_width,
            self.config.projector_height,
            self.config.projector_x,
            self.config.projector_y
        );
        Ok(window)
    }

    fn active_window(&mut self) -> &mut Window {
        match self.projector.as_mut() {
            Some(projector) => projector,
            None => &mut self.editor,
        }
    }
}

impl DisplaySurface for MinifbSurface {
    fn poll_events(&mut self) -> Vec<InputEvent> {
        let mut events = Vec::new();

        if let Some(projector) = &self.projector {
            if !projector.is_open() {
                debug!("Projector window closed");
                events.push(InputEvent::Escape);
                return events;
            }
        }

        let window = self.active_window();
        let position = window.get_mouse_pos(MouseMode::Pass);
        let down = window.get_mouse_down(MouseButton::Left);
        let active = window.is_active();
        let keys: Vec<InputEvent> = KEY_BINDINGS
            .iter()
            .filter(|(key, _)| window.is_key_pressed(*key, KeyRepeat::No))
            .map(|(_, event)| *event)
            .collect();

        self.pointer.update(position, down, active, &mut events);
        events.extend(keys);
        events
    }

    fn present(&mut self, frame: OutputFrame) -> Result<()> {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        self.buffer.clear();
        self.buffer.extend(
            frame
                .image()
                .pixels()
                .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32),
        );

        let result = match self.projector.as_mut() {
            Some(projector) => {
                // Keep the editor responsive while it is not the output
                self.editor.update();
                projector.update_with_buffer(&self.buffer, width, height)
            }
            None => self.editor.update_with_buffer(&self.buffer, width, height),
        };
        result.map_err(|e| anyhow!("Failed to update window: {}", e))
    }

    fn surface_size(&self, mode: Mode) -> (u32, u32) {
        match mode {
            Mode::Editor => (self.config.editor_width, self.config.editor_height),
            Mode::Fullscreen => (self.config.projector_width, self.config.projector_height),
        }
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        match mode {
            Mode::Fullscreen if self.projector.is_none() => {
                self.projector = Some(self.open_projector()?);
            }
            Mode::Editor => {
                if self.projector.take().is_some() {
                    info!("Projector window closed");
                }
            }
            Mode::Fullscreen => {}
        }
        self.pointer = PointerTracker::default();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.editor.is_open()
    }
}
