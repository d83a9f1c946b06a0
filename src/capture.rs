//! Live video from V4L2 capture devices
//!
//! Capture blocks on the device, so it runs on a worker thread that decodes
//! each frame to RGB and publishes it into the shared [`FrameSlot`]. The
//! render loop only ever picks up the newest frame.
//!
//! Supported wire formats: MJPEG, YUYV, RGB24, BGR24.

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::MediaConfig;
use crate::media::{FrameSlot, MediaError, MediaSource, SourceFrame};

/// Supported pixel formats in order of preference
/// MJPEG first: compressed frames need far less USB bandwidth at high resolutions.
const PREFERRED_FORMATS: &[&[u8; 4]] = &[
    b"MJPG", // Motion JPEG - compressed
    b"YUYV", // YUV 4:2:2 - uncompressed
    b"RGB3", // RGB24
    b"BGR3", // BGR24
];

/// How long `start` waits for the worker to open and configure the device
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive capture errors before the worker gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Counts repeated failures and says which ones are worth logging: the
/// first, then every `every`-th.
#[derive(Debug)]
struct FailureThrottle {
    total: u64,
    every: u64,
}

impl FailureThrottle {
    fn new(every: u64) -> Self {
        Self {
            total: 0,
            every: every.max(1),
        }
    }

    /// Count one failure; true if it should be logged
    fn record(&mut self) -> bool {
        self.total += 1;
        self.total == 1 || self.total % self.every == 0
    }

    fn total(&self) -> u64 {
        self.total
    }
}

/// Pixel layout of the buffers the device delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl WireFormat {
    fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            b"MJPG" => WireFormat::Mjpeg,
            b"YUYV" => WireFormat::Yuyv,
            b"BGR3" => WireFormat::Bgr,
            _ => WireFormat::Rgb,
        }
    }
}

/// A capture device feeding frames through a worker thread
pub struct CaptureSource {
    path: PathBuf,
    width: u32,
    height: u32,
    format: WireFormat,
    session: u64,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    last: SourceFrame,
    _worker: JoinHandle<()>,
}

impl CaptureSource {
    /// Open the device on a worker thread and wait until it is streaming
    pub fn start(
        path: &Path,
        config: &MediaConfig,
        slot: Arc<FrameSlot>,
        session: u64,
    ) -> Result<Self, MediaError> {
        let capture_err = |message: String| MediaError::Capture {
            path: path.to_path_buf(),
            message,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = {
            let device_path = path.to_path_buf();
            let (width, height, fps) = (config.capture_width, config.capture_height, config.capture_fps);
            let slot = slot.clone();
            let stop = stop.clone();
            let last_error = last_error.clone();

            std::thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || {
                    let opened = open_device(&device_path, width, height, fps);
                    let (dev, format) = match opened {
                        Ok(opened) => opened,
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{:#}", e)));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(format.clone()));

                    if let Err(e) = run_capture(&dev, &format, session, &slot, &stop, &last_error) {
                        warn!("Capture worker for {:?} stopped: {:#}", device_path, e);
                        *last_error.lock() = Some(format!("{:#}", e));
                    }
                })
                .map_err(|e| capture_err(format!("failed to spawn worker: {}", e)))?
        };

        let format = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(format)) => format,
            Ok(Err(message)) => return Err(capture_err(message)),
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(capture_err("timed out opening device".to_string()));
            }
        };

        let wire = WireFormat::from_fourcc(&format.fourcc.repr);
        info!(
            "Capture {:?} streaming {}x{} {:?}",
            path, format.width, format.height, wire
        );

        Ok(Self {
            path: path.to_path_buf(),
            width: format.width,
            height: format.height,
            format: wire,
            session,
            slot,
            stop,
            last_error,
            last: SourceFrame::new(RgbImage::from_pixel(
                format.width.max(1),
                format.height.max(1),
                Rgb(config.placeholder_color),
            )),
            _worker: worker,
        })
    }
}

impl MediaSource for CaptureSource {
    fn next_frame(&mut self) -> SourceFrame {
        if let Some(frame) = self.slot.latest(self.session) {
            self.last = frame;
        }
        self.last.clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn describe(&self) -> String {
        let mut text = format!(
            "capture {:?} ({}x{} {:?})",
            self.path, self.width, self.height, self.format
        );
        if let Some(e) = self.last_error.lock().as_ref() {
            text.push_str(&format!(", last error: {}", e));
        }
        text
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        // The worker may be blocked inside the driver; it exits on its next
        // frame once it sees the flag or the stale session.
        self.stop.store(true, Ordering::SeqCst);
        debug!("Stopping capture {:?}", self.path);
    }
}

/// Open the device and negotiate format and frame rate
fn open_device(path: &Path, width: u32, height: u32, fps: u32) -> Result<(Device, v4l::Format)> {
    let dev = Device::with_path(path)
        .with_context(|| format!("Failed to open input device: {:?}", path))?;

    let caps = dev.query_caps().context("Failed to query device capabilities")?;
    info!("Camera: {} (driver: {})", caps.card, caps.driver);

    let format = configure_capture_format(&dev, width, height)?;

    if let Err(e) = set_frame_rate(&dev, fps) {
        warn!("Could not set frame rate to {} fps: {}", fps, e);
    }

    Ok((dev, format))
}

/// Capture loop: decode every frame and publish it until stopped or stale
fn run_capture(
    dev: &Device,
    format: &v4l::Format,
    session: u64,
    slot: &FrameSlot,
    stop: &AtomicBool,
    last_error: &Mutex<Option<String>>,
) -> Result<()> {
    let mut stream = Stream::with_buffers(dev, Type::VideoCapture, 4)
        .context("Failed to create capture stream")?;

    let wire = WireFormat::from_fourcc(&format.fourcc.repr);
    let width = format.width as usize;
    let height = format.height as usize;
    let mut rgb_buffer = vec![0u8; width * height * 3];

    let mut frame_count = 0u64;
    let mut errors = 0u32;
    let mut decode_failures = FailureThrottle::new(100);
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);

    while !stop.load(Ordering::SeqCst) {
        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) => {
                errors += 1;
                *last_error.lock() = Some(e.to_string());
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(e).context("Failed to capture frame");
                }
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
        };
        errors = 0;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };

        if let Err(e) = decode_frame(wire, &buf[..used], &mut rgb_buffer, width, height) {
            if decode_failures.record() {
                warn!(
                    "Failed to decode {:?} frame ({} failures so far): {}",
                    wire,
                    decode_failures.total(),
                    e
                );
            }
            continue;
        }

        let image = match RgbImage::from_raw(format.width, format.height, rgb_buffer.clone()) {
            Some(image) => image,
            None => continue,
        };
        if !slot.publish(session, image) {
            debug!("Capture session {} is stale, worker exiting", session);
            break;
        }

        frame_count += 1;
        if last_stats_time.elapsed() >= stats_interval {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            info!(
                "Capture: {:.1} fps ({} frames in {:.1}s)",
                frame_count as f64 / elapsed,
                frame_count,
                elapsed
            );
            frame_count = 0;
            last_stats_time = Instant::now();
        }
    }

    Ok(())
}

/// Convert one device buffer into packed RGB
pub fn decode_frame(
    wire: WireFormat,
    buf: &[u8],
    rgb: &mut [u8],
    width: usize,
    height: usize,
) -> Result<()> {
    match wire {
        WireFormat::Mjpeg => decode_mjpeg(buf, rgb, width, height),
        WireFormat::Yuyv => {
            yuyv_to_rgb(buf, rgb, width, height);
            Ok(())
        }
        WireFormat::Bgr => {
            bgr_to_rgb(buf, rgb);
            Ok(())
        }
        WireFormat::Rgb => {
            let copy_len = buf.len().min(rgb.len());
            rgb[..copy_len].copy_from_slice(&buf[..copy_len]);
            Ok(())
        }
    }
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(dev: &Device, width: u32, height: u32) -> Result<v4l::Format> {
    let formats = dev.enum_formats().context("Failed to enumerate formats")?;

    debug!("Available formats:");
    for fmt in &formats {
        debug!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for preferred in PREFERRED_FORMATS {
        let fourcc = FourCC::new(preferred);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }

        let mut format = dev.format().context("Failed to get current format")?;
        format.width = width;
        format.height = height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) => return Ok(actual),
            Err(e) => {
                warn!(
                    "Could not set format {:?} at {}x{}: {}",
                    String::from_utf8_lossy(*preferred),
                    width,
                    height,
                    e
                );
            }
        }
    }

    // Fall back to whatever the device gives us
    let current = dev.format().context("Failed to get device format")?;
    warn!(
        "Using device's current format: {}x{} {:?}",
        current.width,
        current.height,
        String::from_utf8_lossy(&current.fourcc.repr)
    );
    Ok(current)
}

/// Set the frame rate on the capture device
fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params().context("Failed to get parameters")?;
    params.interval = v4l::Fraction::new(1, fps.max(1));
    dev.set_params(&params).context("Failed to set parameters")?;

    let actual = dev.params().context("Failed to read back parameters")?;
    debug!(
        "Frame interval: {}/{} (requested {} fps)",
        actual.interval.numerator, actual.interval.denominator, fps
    );
    Ok(())
}

/// Decode an MJPEG frame to RGB with jpeg-decoder
fn decode_mjpeg(mjpeg_data: &[u8], rgb_buffer: &mut [u8], width: usize, height: usize) -> Result<()> {
    use std::io::Cursor;

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(mjpeg_data));
    let pixels = decoder.decode().context("Invalid JPEG data")?;
    let info = decoder.info().context("JPEG header missing")?;

    let expected_size = width * height * 3;

    match info.pixel_format {
        jpeg_decoder::PixelFormat::L8 => {
            // Grayscale - expand to RGB
            for (i, &gray) in pixels.iter().enumerate().take(width * height) {
                let offset = i * 3;
                if offset + 2 < rgb_buffer.len() {
                    rgb_buffer[offset] = gray;
                    rgb_buffer[offset + 1] = gray;
                    rgb_buffer[offset + 2] = gray;
                }
            }
        }
        _ => {
            let copy_len = pixels.len().min(rgb_buffer.len()).min(expected_size);
            rgb_buffer[..copy_len].copy_from_slice(&pixels[..copy_len]);
        }
    }

    Ok(())
}

/// Convert YUYV to RGB using fast integer math (no floating point)
/// Uses fixed-point arithmetic with 8-bit shift for BT.601 color conversion
#[inline]
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8], width: usize, height: usize) {
    let pixels = width * height;

    // 2 pixels per step (4 bytes YUYV -> 6 bytes RGB)
    for i in 0..(pixels / 2) {
        let yuyv_offset = i * 4;
        let rgb_offset = i * 6;

        if yuyv_offset + 3 >= yuyv.len() || rgb_offset + 5 >= rgb.len() {
            break;
        }

        let y0 = yuyv[yuyv_offset] as i32;
        let u = yuyv[yuyv_offset + 1] as i32 - 128;
        let y1 = yuyv[yuyv_offset + 2] as i32;
        let v = yuyv[yuyv_offset + 3] as i32 - 128;

        // R = Y + 1.402 V, G = Y - 0.344 U - 0.714 V, B = Y + 1.772 U (scaled by 256)
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        rgb[rgb_offset] = (y0 + v_r).clamp(0, 255) as u8;
        rgb[rgb_offset + 1] = (y0 - uv_g).clamp(0, 255) as u8;
        rgb[rgb_offset + 2] = (y0 + u_b).clamp(0, 255) as u8;

        rgb[rgb_offset + 3] = (y1 + v_r).clamp(0, 255) as u8;
        rgb[rgb_offset + 4] = (y1 - uv_g).clamp(0, 255) as u8;
        rgb[rgb_offset + 5] = (y1 + u_b).clamp(0, 255) as u8;
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (bgr_chunk, rgb_chunk) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        rgb_chunk[0] = bgr_chunk[2];
        rgb_chunk[1] = bgr_chunk[1];
        rgb_chunk[2] = bgr_chunk[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_gray_is_neutral() {
        // Y=128 with neutral chroma decodes to mid gray
        let yuyv = [128u8, 128, 128, 128];
        let mut rgb = [0u8; 6];
        yuyv_to_rgb(&yuyv, &mut rgb, 2, 1);
        assert_eq!(rgb, [128, 128, 128, 128, 128, 128]);
    }

    #[test]
    fn test_bgr_to_rgb() {
        let bgr = vec![0u8, 128u8, 255u8];
        let mut rgb = vec![0u8; 3];
        bgr_to_rgb(&bgr, &mut rgb);
        assert_eq!(rgb, vec![255, 128, 0]);
    }

    #[test]
    fn test_wire_format_from_fourcc() {
        assert_eq!(WireFormat::from_fourcc(b"MJPG"), WireFormat::Mjpeg);
        assert_eq!(WireFormat::from_fourcc(b"YUYV"), WireFormat::Yuyv);
        assert_eq!(WireFormat::from_fourcc(b"BGR3"), WireFormat::Bgr);
        assert_eq!(WireFormat::from_fourcc(b"RGB3"), WireFormat::Rgb);
    }

    #[test]
    fn test_decode_mjpeg_frame() {
        use image::codecs::jpeg::JpegEncoder;
        use image::ColorType;

        let (w, h) = (16usize, 8usize);
        let raw = vec![200u8; w * h * 3];
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 95)
            .encode(&raw, w as u32, h as u32, ColorType::Rgb8)
            .unwrap();

        let mut rgb = vec![0u8; w * h * 3];
        decode_frame(WireFormat::Mjpeg, &jpeg, &mut rgb, w, h).unwrap();
        assert!(rgb.iter().all(|&v| (v as i32 - 200).abs() <= 3));
    }

    #[test]
    fn test_decode_garbage_mjpeg_fails() {
        let mut rgb = vec![0u8; 12];
        assert!(decode_frame(WireFormat::Mjpeg, &[1, 2, 3], &mut rgb, 2, 2).is_err());
    }

    #[test]
    fn test_decode_failures_are_throttled_without_successes() {
        let mut throttle = FailureThrottle::new(100);
        let logged = (0..250).filter(|_| throttle.record()).count();
        // First failure, then the 100th and 200th
        assert_eq!(logged, 3);
        assert_eq!(throttle.total(), 250);
    }
}
