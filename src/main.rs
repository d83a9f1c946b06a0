//! QuadMap - live four-corner projection mapping
//!
//! Loads an image, animated GIF, video file or capture device, lets the
//! operator drag the four corners of a quad in an editor window, and projects
//! the source warped onto that quad through a borderless projector window.

mod config;
mod display;
mod interaction;
mod media;
mod preset;
mod quad;
mod render;
mod transform;
mod video;
mod warp;

#[cfg(target_os = "linux")]
mod capture;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::media::{FrameSlot, Playlist};
use crate::preset::PresetStore;
use crate::render::{Mode, RenderLoop};

/// QuadMap - project images and video onto arbitrary quadrilaterals
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media to project: image, GIF, video file or capture device (repeat to build a playlist)
    #[arg(short, long)]
    media: Vec<PathBuf>,

    /// Preset to load at startup
    #[arg(short, long)]
    preset: Option<String>,

    /// Start on the projector output instead of the editor
    #[arg(short, long)]
    fullscreen: bool,

    /// List stored presets and exit
    #[arg(long)]
    list_presets: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("QuadMap v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = config::Config::load_or_create(&args.config)?;

    // CLI args override the config file
    if !args.media.is_empty() {
        config.media.playlist = args.media.clone();
    }

    let store = PresetStore::new(config.presets.directory.clone());

    if args.list_presets {
        let names = store.list()?;
        if names.is_empty() {
            println!("No presets in {:?}", store.dir());
        }
        for name in names {
            println!("{}", name);
        }
        return Ok(());
    }

    info!(
        "Editor {}x{}, projector {}x{} @ {}fps",
        config.display.editor_width,
        config.display.editor_height,
        config.display.projector_width,
        config.display.projector_height,
        config.display.fps
    );

    let slot = Arc::new(FrameSlot::new());
    let playlist = Playlist::new(config.media.playlist.clone(), config.media.clone(), slot);
    if playlist.is_empty() {
        warn!("No media given, projecting a placeholder");
    } else {
        info!("Playlist: {} item(s)", playlist.len());
    }
    let media = playlist.open_current();

    let surface = display::MinifbSurface::new(&config.display)?;
    let mut render_loop = RenderLoop::new(surface, media, &config).with_playlist(playlist);

    if let Some(name) = &args.preset {
        if let Err(e) = store.load_into(name, render_loop.quad_mut()) {
            warn!("Could not load preset {:?}: {}", name, e);
        }
    }

    if args.fullscreen {
        render_loop.request_mode(Mode::Fullscreen);
    }

    render_loop.run();
    Ok(())
}
