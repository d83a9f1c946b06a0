//! Video files decoded by an `ffmpeg` subprocess
//!
//! `ffprobe` reports the stream size up front. A worker thread then reads raw
//! RGB24 frames from `ffmpeg`, paced at the file's native rate, and publishes
//! them into the shared [`FrameSlot`]. At end of file the decoder is started
//! again so playback loops.

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use serde::Deserialize;
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::media::{FrameSlot, MediaError, MediaSource, SourceFrame};

/// File extensions routed to the video decoder
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mov", "avi", "mkv", "webm", "mpg", "mpeg"];

pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

/// Size and rate of the first video stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

impl StreamInfo {
    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

#[derive(Debug, Deserialize)]
struct StreamReport {
    #[serde(default)]
    streams: Vec<ReportedStream>,
}

#[derive(Debug, Deserialize)]
struct ReportedStream {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    r_frame_rate: Option<String>,
}

/// Parse `ffprobe -of json` output
fn parse_stream_info(json: &str) -> Result<StreamInfo> {
    let report: StreamReport = serde_json::from_str(json).context("Malformed ffprobe output")?;
    let stream = report
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No video stream"))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(StreamInfo {
            width,
            height,
            fps: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
        }),
        _ => bail!("Video stream has no frame size"),
    }
}

/// "30000/1001" or "25" to frames per second
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if num <= 0.0 || den <= 0.0 {
        return None;
    }
    Some(num / den)
}

fn query_stream(ffprobe: &str, path: &Path) -> Result<StreamInfo> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to run {}", ffprobe))?;

    if !output.status.success() {
        bail!(
            "{} failed: {}",
            ffprobe,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_stream_info(&String::from_utf8_lossy(&output.stdout))
}

/// One pass over the file as raw RGB24 on stdout, at native speed
fn decoder_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-nostdin", "-re", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_owned());
    args.extend(
        ["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .iter()
            .map(OsString::from),
    );
    args
}

/// How a decode pass ended
#[derive(Debug, PartialEq, Eq)]
enum PassEnd {
    /// Stop requested or the session went stale
    Stopped,
    /// End of stream after this many frames
    Finished(u64),
}

/// Worker-side state: spawns `ffmpeg` and feeds the slot
struct Decoder {
    ffmpeg: String,
    path: PathBuf,
    info: StreamInfo,
    session: u64,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
}

impl Decoder {
    fn spawn(&self) -> Result<Child> {
        Command::new(&self.ffmpeg)
            .args(decoder_args(&self.path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.ffmpeg))
    }

    /// Play passes back to back until stopped
    fn run(&self, mut child: Child) -> Result<()> {
        let mut buffer = vec![0u8; self.info.frame_len()];
        let mut passes = 0u64;

        loop {
            let end = match child.stdout.as_mut() {
                Some(stdout) => self.play_pass(stdout, &mut buffer),
                None => Err(anyhow!("ffmpeg stdout not captured")),
            };
            let _ = child.kill();
            let _ = child.wait();

            match end? {
                PassEnd::Stopped => return Ok(()),
                PassEnd::Finished(0) => bail!("ffmpeg produced no frames"),
                PassEnd::Finished(frames) => {
                    passes += 1;
                    debug!("Video pass {} ended after {} frames, looping", passes, frames);
                }
            }
            child = self.spawn()?;
        }
    }

    /// Publish frames from `reader` until end of stream or a stop
    fn play_pass<R: Read>(&self, reader: &mut R, buffer: &mut [u8]) -> Result<PassEnd> {
        let mut frames = 0u64;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(PassEnd::Stopped);
            }

            match reader.read_exact(buffer) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(PassEnd::Finished(frames)),
                Err(e) => return Err(e).context("Failed to read decoded frame"),
            }

            let image = RgbImage::from_raw(self.info.width, self.info.height, buffer.to_vec())
                .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}", self.info.width, self.info.height))?;
            if !self.slot.publish(self.session, image) {
                debug!("Video session {} is stale, worker exiting", self.session);
                return Ok(PassEnd::Stopped);
            }
            frames += 1;
        }
    }
}

/// A looping video file decoded on a worker thread
pub struct VideoFile {
    path: PathBuf,
    info: StreamInfo,
    session: u64,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    last: SourceFrame,
    _worker: JoinHandle<()>,
}

impl VideoFile {
    /// Probe the file, start the decoder and hand back a source that shows
    /// the newest decoded frame
    pub fn start(
        path: &Path,
        config: &MediaConfig,
        slot: Arc<FrameSlot>,
        session: u64,
    ) -> Result<Self, MediaError> {
        let video_err = |e: anyhow::Error| MediaError::Video {
            path: path.to_path_buf(),
            message: format!("{:#}", e),
        };

        let info = query_stream(&config.ffprobe, path).map_err(video_err)?;
        let stop = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));

        let decoder = Decoder {
            ffmpeg: config.ffmpeg.clone(),
            path: path.to_path_buf(),
            info,
            session,
            slot: slot.clone(),
            stop: stop.clone(),
        };
        let child = decoder.spawn().map_err(video_err)?;

        let worker = {
            let last_error = last_error.clone();
            std::thread::Builder::new()
                .name("video".to_string())
                .spawn(move || {
                    if let Err(e) = decoder.run(child) {
                        warn!("Video decoder for {:?} stopped: {:#}", decoder.path, e);
                        *last_error.lock() = Some(format!("{:#}", e));
                    }
                })
                .map_err(|e| video_err(anyhow!("failed to spawn worker: {}", e)))?
        };

        info!(
            "Video {:?} {}x{} @ {}",
            path,
            info.width,
            info.height,
            info.fps
                .map(|fps| format!("{:.2} fps", fps))
                .unwrap_or_else(|| "unknown rate".to_string())
        );

        Ok(Self {
            path: path.to_path_buf(),
            info,
            session,
            slot,
            stop,
            last_error,
            last: SourceFrame::new(RgbImage::from_pixel(
                info.width,
                info.height,
                Rgb(config.placeholder_color),
            )),
            _worker: worker,
        })
    }
}

impl MediaSource for VideoFile {
    fn next_frame(&mut self) -> SourceFrame {
        if let Some(frame) = self.slot.latest(self.session) {
            self.last = frame;
        }
        self.last.clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    fn describe(&self) -> String {
        let mut text = format!(
            "video {:?} ({}x{})",
            self.path, self.info.width, self.info.height
        );
        if let Some(e) = self.last_error.lock().as_ref() {
            text.push_str(&format!(", last error: {}", e));
        }
        text
    }
}

impl Drop for VideoFile {
    fn drop(&mut self) {
        // The worker kills ffmpeg on its next frame
        self.stop.store(true, Ordering::SeqCst);
        debug!("Stopping video {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decoder(slot: &Arc<FrameSlot>, session: u64) -> Decoder {
        Decoder {
            ffmpeg: "ffmpeg".to_string(),
            path: PathBuf::from("clip.mp4"),
            info: StreamInfo {
                width: 2,
                height: 1,
                fps: Some(25.0),
            },
            session,
            slot: slot.clone(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_video_extensions() {
        assert!(is_video_path(Path::new("/media/loop.MP4")));
        assert!(is_video_path(Path::new("clip.webm")));
        assert!(!is_video_path(Path::new("still.png")));
        assert!(!is_video_path(Path::new("/dev/video0")));
    }

    #[test]
    fn test_parse_stream_info() {
        let json = r#"{"programs": [], "streams": [{"width": 1280, "height": 720, "r_frame_rate": "30000/1001"}]}"#;
        let info = parse_stream_info(json).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert!((info.fps.unwrap() - 29.97).abs() < 0.01);

        assert!(parse_stream_info(r#"{"streams": []}"#).is_err());
        assert!(parse_stream_info(r#"{"streams": [{"r_frame_rate": "25/1"}]}"#).is_err());
        assert!(parse_stream_info("not json").is_err());
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_decoder_args_stream_raw_rgb() {
        let args = decoder_args(Path::new("/media/clip.mp4"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/media/clip.mp4");
        assert!(args.contains(&"-re".to_string()));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_pass_publishes_whole_frames_until_eof() {
        let slot = Arc::new(FrameSlot::new());
        let session = slot.begin_session();
        let decoder = decoder(&slot, session);

        // Two full 2x1 frames and a truncated third
        let bytes = vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4, 9, 9];
        let mut buffer = vec![0u8; decoder.info.frame_len()];
        let end = decoder.play_pass(&mut Cursor::new(bytes), &mut buffer).unwrap();

        assert_eq!(end, PassEnd::Finished(2));
        let frame = slot.latest(session).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0).0, [3, 3, 3]);
        assert_eq!(frame.image().get_pixel(1, 0).0, [4, 4, 4]);
    }

    #[test]
    fn test_pass_stops_on_stale_session() {
        let slot = Arc::new(FrameSlot::new());
        let old = slot.begin_session();
        let decoder = decoder(&slot, old);
        slot.begin_session();

        let mut buffer = vec![0u8; decoder.info.frame_len()];
        let end = decoder
            .play_pass(&mut Cursor::new(vec![7u8; 60]), &mut buffer)
            .unwrap();
        assert_eq!(end, PassEnd::Stopped);
    }

    #[test]
    fn test_pass_honours_stop_flag() {
        let slot = Arc::new(FrameSlot::new());
        let session = slot.begin_session();
        let decoder = decoder(&slot, session);
        decoder.stop.store(true, Ordering::SeqCst);

        let mut buffer = vec![0u8; decoder.info.frame_len()];
        let end = decoder
            .play_pass(&mut Cursor::new(vec![7u8; 60]), &mut buffer)
            .unwrap();
        assert_eq!(end, PassEnd::Stopped);
        assert!(slot.latest(session).is_none());
    }

    #[test]
    fn test_unreadable_video_falls_back_to_placeholder() {
        let slot = Arc::new(FrameSlot::new());
        let config = MediaConfig {
            ffprobe: "/nonexistent/ffprobe".to_string(),
            ..MediaConfig::default()
        };
        let source = crate::media::open_media(Path::new("/nonexistent/clip.mp4"), &config, &slot);
        assert!(source.describe().starts_with("placeholder"));
        assert!(source.describe().contains("clip.mp4"));
    }
}
