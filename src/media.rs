//! Media sources: still images, animated images, video files, capture devices
//!
//! Every source hands the render loop an RGB frame on demand without
//! blocking. Sources that decode on a worker thread publish into a
//! [`FrameSlot`], which keeps only the newest frame of the current session.

use arc_swap::ArcSwapOption;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, Rgb, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MediaConfig;

/// GIF frames with no usable delay play at this interval, like browsers do
const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to load {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to open {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0:?} contains no frames")]
    Empty(PathBuf),
    #[error("capture device {path:?}: {message}")]
    Capture { path: PathBuf, message: String },
    #[error("video {path:?}: {message}")]
    Video { path: PathBuf, message: String },
}

/// One source raster, shared read-only with the render loop
#[derive(Debug, Clone)]
pub struct SourceFrame {
    image: Arc<RgbImage>,
}

impl SourceFrame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Anything that can supply frames to the render loop
pub trait MediaSource {
    /// Current frame. Must not block: returns the latest decoded frame or a
    /// cached one.
    fn next_frame(&mut self) -> SourceFrame;

    /// Frame dimensions (W, H)
    fn dimensions(&self) -> (u32, u32);

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

/// A single image, returned unchanged every tick
pub struct StillImage {
    path: PathBuf,
    frame: SourceFrame,
}

impl StillImage {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let image = image::open(path).map_err(|source| MediaError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            frame: SourceFrame::new(image.to_rgb8()),
        })
    }
}

impl MediaSource for StillImage {
    fn next_frame(&mut self) -> SourceFrame {
        self.frame.clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame.dimensions()
    }

    fn describe(&self) -> String {
        let (w, h) = self.dimensions();
        format!("image {:?} ({}x{})", self.path, w, h)
    }
}

/// A looping animation played at its native frame timing
pub struct AnimatedImage {
    path: PathBuf,
    frames: Vec<(SourceFrame, Duration)>,
    total: Duration,
    started: Instant,
}

impl AnimatedImage {
    /// Decode every frame of an animated GIF up front
    pub fn open_gif(path: &Path) -> Result<Self, MediaError> {
        let file = File::open(path).map_err(|source| MediaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let decode_err = |source: image::ImageError| MediaError::Decode {
            path: path.to_path_buf(),
            source,
        };
        let decoder = GifDecoder::new(BufReader::new(file)).map_err(decode_err)?;
        let frames = decoder.into_frames().collect_frames().map_err(decode_err)?;

        let frames: Vec<_> = frames
            .into_iter()
            .map(|frame| {
                let (num, den) = frame.delay().numer_denom_ms();
                let ms = if den == 0 { 0 } else { num / den };
                let delay = if ms < 20 {
                    DEFAULT_FRAME_DELAY
                } else {
                    Duration::from_millis(ms as u64)
                };
                let rgb = DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8();
                (SourceFrame::new(rgb), delay)
            })
            .collect();

        Self::from_frames(path, frames)
    }

    pub fn from_frames(path: &Path, frames: Vec<(SourceFrame, Duration)>) -> Result<Self, MediaError> {
        if frames.is_empty() {
            return Err(MediaError::Empty(path.to_path_buf()));
        }
        let total = frames.iter().map(|(_, d)| *d).sum();
        Ok(Self {
            path: path.to_path_buf(),
            frames,
            total,
            started: Instant::now(),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frame shown `elapsed` after playback started, looping at the end
    pub fn frame_at(&self, elapsed: Duration) -> &SourceFrame {
        if self.total.is_zero() {
            return &self.frames[0].0;
        }
        let mut t = Duration::from_nanos((elapsed.as_nanos() % self.total.as_nanos()) as u64);
        for (frame, delay) in &self.frames {
            if t < *delay {
                return frame;
            }
            t -= *delay;
        }
        &self.frames[self.frames.len() - 1].0
    }
}

impl MediaSource for AnimatedImage {
    fn next_frame(&mut self) -> SourceFrame {
        self.frame_at(self.started.elapsed()).clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frames[0].0.dimensions()
    }

    fn describe(&self) -> String {
        let (w, h) = self.dimensions();
        format!(
            "animation {:?} ({}x{}, {} frames, {:.2}s loop)",
            self.path,
            w,
            h,
            self.frames.len(),
            self.total.as_secs_f64()
        )
    }
}

/// Solid color frame shown when media could not be loaded
pub struct Placeholder {
    frame: SourceFrame,
    reason: String,
}

impl Placeholder {
    pub fn new(width: u32, height: u32, color: [u8; 3], reason: impl Into<String>) -> Self {
        Self {
            frame: SourceFrame::new(RgbImage::from_pixel(width.max(1), height.max(1), Rgb(color))),
            reason: reason.into(),
        }
    }

    pub fn from_config(config: &MediaConfig, reason: impl Into<String>) -> Self {
        Self::new(
            config.placeholder_width,
            config.placeholder_height,
            config.placeholder_color,
            reason,
        )
    }
}

impl MediaSource for Placeholder {
    fn next_frame(&mut self) -> SourceFrame {
        self.frame.clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame.dimensions()
    }

    fn describe(&self) -> String {
        format!("placeholder ({})", self.reason)
    }
}

/// A frame tagged with the source session it was decoded for
#[derive(Debug)]
pub struct TaggedFrame {
    pub session: u64,
    pub frame: SourceFrame,
}

/// Single-slot handoff from a decode worker to the render loop.
///
/// Only the newest frame is kept; older ones are overwritten, never queued.
/// Starting a new session (switching or stopping a source) invalidates
/// everything decoded for earlier sessions.
pub struct FrameSlot {
    session: AtomicU64,
    latest: ArcSwapOption<TaggedFrame>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            session: AtomicU64::new(0),
            latest: ArcSwapOption::empty(),
        }
    }

    /// Start a new session and drop whatever the slot holds
    pub fn begin_session(&self) -> u64 {
        let id = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.store(None);
        id
    }

    pub fn current_session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Publish a decoded frame. Frames for a stale session are dropped and
    /// `false` is returned so the worker can stop.
    pub fn publish(&self, session: u64, image: RgbImage) -> bool {
        if session != self.current_session() {
            return false;
        }
        self.latest.store(Some(Arc::new(TaggedFrame {
            session,
            frame: SourceFrame::new(image),
        })));
        true
    }

    /// Newest frame of `session`, if one has arrived
    pub fn latest(&self, session: u64) -> Option<SourceFrame> {
        self.latest
            .load_full()
            .filter(|tagged| tagged.session == session)
            .map(|tagged| tagged.frame.clone())
    }
}

/// Ordered list of media paths the operator can cycle through
pub struct Playlist {
    paths: Vec<PathBuf>,
    index: usize,
    config: MediaConfig,
    slot: Arc<FrameSlot>,
}

impl Playlist {
    pub fn new(paths: Vec<PathBuf>, config: MediaConfig, slot: Arc<FrameSlot>) -> Self {
        Self {
            paths,
            index: 0,
            config,
            slot,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn current(&self) -> Option<&Path> {
        self.paths.get(self.index).map(PathBuf::as_path)
    }

    /// Open the current entry; a placeholder if the playlist is empty
    pub fn open_current(&self) -> Box<dyn MediaSource> {
        match self.current() {
            Some(path) => open_media(path, &self.config, &self.slot),
            None => {
                self.slot.begin_session();
                Box::new(Placeholder::from_config(&self.config, "no media selected"))
            }
        }
    }

    /// Step to the next entry (wrapping) and open it
    pub fn advance(&mut self) -> Option<Box<dyn MediaSource>> {
        if self.paths.len() < 2 {
            return None;
        }
        self.index = (self.index + 1) % self.paths.len();
        Some(self.open_current())
    }
}

/// Open a media path, falling back to a placeholder on failure.
///
/// Always starts a new slot session, so frames still in flight from the
/// previous source are ignored.
pub fn open_media(path: &Path, config: &MediaConfig, slot: &Arc<FrameSlot>) -> Box<dyn MediaSource> {
    let session = slot.begin_session();
    match try_open(path, config, slot, session) {
        Ok(source) => {
            info!("Opened {}", source.describe());
            source
        }
        Err(e) => {
            warn!("Media unavailable, showing placeholder: {}", e);
            Box::new(Placeholder::from_config(config, e.to_string()))
        }
    }
}

fn try_open(
    path: &Path,
    config: &MediaConfig,
    slot: &Arc<FrameSlot>,
    session: u64,
) -> Result<Box<dyn MediaSource>, MediaError> {
    if is_capture_device(path) {
        return open_capture(path, config, slot, session);
    }

    if crate::video::is_video_path(path) {
        let video = crate::video::VideoFile::start(path, config, slot.clone(), session)?;
        return Ok(Box::new(video));
    }

    let is_gif = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gif"))
        .unwrap_or(false);

    if is_gif {
        let animation = AnimatedImage::open_gif(path)?;
        if animation.frame_count() > 1 {
            return Ok(Box::new(animation));
        }
    }

    Ok(Box::new(StillImage::open(path)?))
}

fn is_capture_device(path: &Path) -> bool {
    path.to_str()
        .map(|p| p.starts_with("/dev/video"))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn open_capture(
    path: &Path,
    config: &MediaConfig,
    slot: &Arc<FrameSlot>,
    session: u64,
) -> Result<Box<dyn MediaSource>, MediaError> {
    let source = crate::capture::CaptureSource::start(path, config, slot.clone(), session)?;
    Ok(Box::new(source))
}

#[cfg(not(target_os = "linux"))]
fn open_capture(
    path: &Path,
    _config: &MediaConfig,
    _slot: &Arc<FrameSlot>,
    _session: u64,
) -> Result<Box<dyn MediaSource>, MediaError> {
    Err(MediaError::Capture {
        path: path.to_path_buf(),
        message: "V4L2 capture is only available on Linux".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, v: u8) -> SourceFrame {
        SourceFrame::new(RgbImage::from_pixel(w, h, Rgb([v, v, v])))
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("quadmap-media-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_still_image_repeats_frame() {
        let dir = temp_dir("still");
        let path = dir.join("wall.png");
        RgbImage::from_pixel(6, 4, Rgb([10, 20, 30])).save(&path).unwrap();

        let mut source = StillImage::open(&path).unwrap();
        assert_eq!(source.dimensions(), (6, 4));
        let a = source.next_frame();
        let b = source.next_frame();
        assert_eq!(a.image(), b.image());
        assert_eq!(a.image().get_pixel(0, 0).0, [10, 20, 30]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_animation_timing_loops() {
        let frames = vec![
            (solid(2, 2, 0), Duration::from_millis(100)),
            (solid(2, 2, 1), Duration::from_millis(50)),
            (solid(2, 2, 2), Duration::from_millis(50)),
        ];
        let anim = AnimatedImage::from_frames(Path::new("test.gif"), frames).unwrap();

        let value = |ms| anim.frame_at(Duration::from_millis(ms)).image().get_pixel(0, 0).0[0];
        assert_eq!(value(0), 0);
        assert_eq!(value(99), 0);
        assert_eq!(value(100), 1);
        assert_eq!(value(160), 2);
        // Loops after 200ms
        assert_eq!(value(200), 0);
        assert_eq!(value(310), 1);
    }

    fn write_gif(path: &Path, frames: &[([u8; 3], u32)]) {
        use image::codecs::gif::{GifEncoder, Repeat};
        use image::{Delay, Frame, Rgba, RgbaImage};

        let file = File::create(path).unwrap();
        let mut encoder = GifEncoder::new(file);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        for (color, ms) in frames {
            let [r, g, b] = *color;
            let image = RgbaImage::from_pixel(4, 3, Rgba([r, g, b, 255]));
            let delay = Delay::from_numer_denom_ms(*ms, 1);
            encoder.encode_frame(Frame::from_parts(image, 0, 0, delay)).unwrap();
        }
    }

    #[test]
    fn test_gif_file_plays_with_decoded_delays() {
        let dir = temp_dir("gif");
        let path = dir.join("loop.gif");
        // The second delay is too short and is raised to the default
        write_gif(&path, &[([255, 0, 0], 150), ([0, 0, 255], 10)]);

        let anim = AnimatedImage::open_gif(&path).unwrap();
        assert_eq!(anim.frame_count(), 2);
        assert_eq!(anim.dimensions(), (4, 3));

        let color = |ms| anim.frame_at(Duration::from_millis(ms)).image().get_pixel(1, 1).0;
        assert_eq!(color(0), [255, 0, 0]);
        assert_eq!(color(149), [255, 0, 0]);
        assert_eq!(color(150), [0, 0, 255]);
        assert_eq!(color(249), [0, 0, 255]);
        assert_eq!(color(250), [255, 0, 0]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_gif_routing_by_frame_count() {
        let dir = temp_dir("gif-routing");
        let slot = Arc::new(FrameSlot::new());
        let config = MediaConfig::default();

        let animated = dir.join("two.GIF");
        write_gif(&animated, &[([0, 255, 0], 100), ([255, 255, 255], 100)]);
        let source = open_media(&animated, &config, &slot);
        assert!(source.describe().starts_with("animation"));
        assert!(source.describe().contains("2 frames"));

        let single = dir.join("one.gif");
        write_gif(&single, &[([0, 255, 0], 100)]);
        let mut source = open_media(&single, &config, &slot);
        assert!(source.describe().starts_with("image"));
        assert_eq!(source.next_frame().image().get_pixel(0, 0).0, [0, 255, 0]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_animation_without_frames_is_rejected() {
        assert!(matches!(
            AnimatedImage::from_frames(Path::new("empty.gif"), Vec::new()),
            Err(MediaError::Empty(_))
        ));
    }

    #[test]
    fn test_missing_file_falls_back_to_placeholder() {
        let slot = Arc::new(FrameSlot::new());
        let config = MediaConfig::default();
        let mut source = open_media(Path::new("/nonexistent/quadmap.png"), &config, &slot);

        assert_eq!(
            source.dimensions(),
            (config.placeholder_width, config.placeholder_height)
        );
        assert_eq!(
            source.next_frame().image().get_pixel(0, 0).0,
            config.placeholder_color
        );
        assert!(source.describe().starts_with("placeholder"));
    }

    #[test]
    fn test_slot_keeps_only_latest() {
        let slot = FrameSlot::new();
        let session = slot.begin_session();
        assert!(slot.latest(session).is_none());

        assert!(slot.publish(session, RgbImage::from_pixel(1, 1, Rgb([1, 1, 1]))));
        assert!(slot.publish(session, RgbImage::from_pixel(1, 1, Rgb([2, 2, 2]))));

        let frame = slot.latest(session).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0).0, [2, 2, 2]);
    }

    #[test]
    fn test_slot_drops_stale_sessions() {
        let slot = Arc::new(FrameSlot::new());
        let old = slot.begin_session();
        assert!(slot.publish(old, RgbImage::new(1, 1)));

        let new = slot.begin_session();
        assert!(slot.latest(old).is_none());
        assert!(slot.latest(new).is_none());

        // A worker still decoding for the old session
        let worker_slot = slot.clone();
        let accepted = std::thread::spawn(move || worker_slot.publish(old, RgbImage::new(1, 1)))
            .join()
            .unwrap();
        assert!(!accepted);
        assert!(slot.latest(new).is_none());
    }

    #[test]
    fn test_opening_media_starts_new_session() {
        let slot = Arc::new(FrameSlot::new());
        let before = slot.current_session();
        let _source = open_media(Path::new("/nonexistent/a.png"), &MediaConfig::default(), &slot);
        assert_eq!(slot.current_session(), before + 1);
    }

    #[test]
    fn test_playlist_cycles_and_wraps() {
        let slot = Arc::new(FrameSlot::new());
        let mut playlist = Playlist::new(
            vec![PathBuf::from("/nonexistent/a.png"), PathBuf::from("/nonexistent/b.png")],
            MediaConfig::default(),
            slot.clone(),
        );

        assert_eq!(playlist.current(), Some(Path::new("/nonexistent/a.png")));
        assert!(playlist.advance().is_some());
        assert_eq!(playlist.current(), Some(Path::new("/nonexistent/b.png")));
        assert!(playlist.advance().is_some());
        assert_eq!(playlist.current(), Some(Path::new("/nonexistent/a.png")));
        assert_eq!(slot.current_session(), 2);
    }

    #[test]
    fn test_single_entry_playlist_does_not_advance() {
        let slot = Arc::new(FrameSlot::new());
        let mut playlist = Playlist::new(
            vec![PathBuf::from("/nonexistent/a.png")],
            MediaConfig::default(),
            slot,
        );
        assert!(playlist.advance().is_none());

        let empty = Playlist::new(Vec::new(), MediaConfig::default(), Arc::new(FrameSlot::new()));
        assert!(empty.is_empty());
        assert!(empty.open_current().describe().contains("no media"));
    }
}
