//! V4L2 capture backend using memory-mapped buffers

use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::{BackendKind, CaptureBackend, CaptureStream, OpenRequest};
use crate::error::{AppError, Result};
use crate::video::convert::yuyv_to_rgb24;
use crate::video::decoder::MjpegDecoder;
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::VideoFrame;
use crate::video::source::SourceId;

/// Dequeue timeout; a device that delivers nothing for this long reports a read failure
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens capture devices by index (`/dev/video<N>`) or device node path
pub struct V4l2Backend {
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
        }
    }

    fn open_device(id: &SourceId) -> Result<Device> {
        let device = match id {
            SourceId::Device(index) => Device::new(*index as usize),
            SourceId::Path(path) => Device::with_path(path),
            SourceId::Url(_) => {
                return Err(AppError::Unsupported(format!("{} is not a V4L2 device", id)))
            }
        };
        device.map_err(|e| AppError::VideoError(format!("Failed to open device {}: {}", id, e)))
    }
}

impl CaptureBackend for V4l2Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::V4l2
    }

    fn supports(&self, id: &SourceId) -> bool {
        id.is_device()
    }

    fn open(&self, id: &SourceId, request: &OpenRequest) -> Result<Box<dyn CaptureStream>> {
        let device = Self::open_device(id)?;

        let caps = device
            .query_caps()
            .map_err(|e| AppError::VideoError(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(AppError::VideoError(format!(
                "{} ({}) does not support video capture",
                id, caps.card
            )));
        }

        let (format, actual) = negotiate_format(&device, request.resolution)?;

        if let Some(fps) = request.fps {
            if let Err(e) = device.set_params(&Parameters::with_fps(fps.round().max(1.0) as u32)) {
                warn!("Failed to set hardware FPS on {}: {}", id, e);
            }
        }
        let fps = device.params().ok().and_then(|params| {
            let interval = params.interval;
            (interval.numerator > 0).then(|| interval.denominator as f64 / interval.numerator as f64)
        });

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| AppError::VideoError(format!("Failed to request buffers: {}", e)))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let resolution = Resolution::new(actual.width, actual.height);
        info!(
            "V4L2 {} ({}): {} {} stride={} fps={:?}",
            id, caps.card, resolution, format, actual.stride, fps
        );

        let decoder = if format.is_compressed() {
            Some(MjpegDecoder::new()?)
        } else {
            None
        };

        Ok(Box::new(V4l2Stream {
            stream: Some(stream),
            device: Some(device),
            format,
            resolution,
            stride: actual.stride,
            fps,
            decoder,
            lost: false,
        }))
    }
}

/// Ask the device for each preferred format at the requested size; keep the first it accepts
fn negotiate_format(device: &Device, resolution: Resolution) -> Result<(PixelFormat, Format)> {
    let current = device
        .format()
        .map_err(|e| AppError::VideoError(format!("Failed to get format: {}", e)))?;
    let (width, height) = if resolution.is_empty() {
        (current.width, current.height)
    } else {
        (resolution.width, resolution.height)
    };

    for format in PixelFormat::capture_preference() {
        let wanted = Format::new(width, height, format.to_fourcc());
        match device.set_format(&wanted) {
            Ok(actual) if PixelFormat::from_fourcc(actual.fourcc) == Some(*format) => {
                if actual.width != width || actual.height != height {
                    debug!(
                        "Requested {}x{}, device chose {}x{}",
                        width, height, actual.width, actual.height
                    );
                }
                return Ok((*format, actual));
            }
            Ok(actual) => debug!("Device rejected {}, offered {}", format, actual.fourcc),
            Err(e) => debug!("Failed to set {} format: {}", format, e),
        }
    }

    Err(AppError::VideoError(format!(
        "No supported pixel format (device offers {})",
        current.fourcc
    )))
}

/// Errors after which the device node is gone rather than momentarily idle
fn is_device_lost(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(6)         // ENXIO
            | Some(19)  // ENODEV
            | Some(5)   // EIO
            | Some(32)  // EPIPE
            | Some(108) // ESHUTDOWN
    )
}

/// Strip row padding from a packed buffer
fn pack_rows(data: &[u8], row_bytes: usize, stride: usize, rows: usize) -> Cow<'_, [u8]> {
    if stride <= row_bytes {
        return Cow::Borrowed(data);
    }
    let mut packed = Vec::with_capacity(row_bytes * rows);
    for row in data.chunks(stride).take(rows) {
        packed.extend_from_slice(&row[..row_bytes.min(row.len())]);
    }
    Cow::Owned(packed)
}

/// Open V4L2 capture stream
pub struct V4l2Stream {
    stream: Option<Stream<'static>>,
    device: Option<Device>,
    format: PixelFormat,
    resolution: Resolution,
    stride: u32,
    fps: Option<f64>,
    decoder: Option<MjpegDecoder>,
    lost: bool,
}

impl CaptureStream for V4l2Stream {
    fn read(&mut self) -> Result<VideoFrame> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(AppError::ReadFailure("device released".to_string()));
        };

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                if is_device_lost(&e) {
                    self.lost = true;
                }
                return Err(AppError::ReadFailure(format!("dequeue failed: {}", e)));
            }
        };
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used == 0 { buf } else { &buf[..used] };

        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        match self.format {
            PixelFormat::Mjpeg | PixelFormat::Jpeg => match self.decoder.as_mut() {
                Some(decoder) => decoder.decode(data, 0),
                None => Err(AppError::VideoError("MJPEG decoder missing".to_string())),
            },
            PixelFormat::Yuyv => {
                let packed = pack_rows(data, width * 2, self.stride as usize, height);
                let rgb = yuyv_to_rgb24(&packed, self.resolution)?;
                VideoFrame::from_rgb(rgb, self.resolution, 0)
            }
            PixelFormat::Rgb24 => {
                let packed = pack_rows(data, width * 3, self.stride as usize, height);
                let expected = width * height * 3;
                if packed.len() < expected {
                    return Err(AppError::ReadFailure(format!(
                        "short RGB24 buffer: {} < {}",
                        packed.len(),
                        expected
                    )));
                }
                VideoFrame::from_rgb(packed[..expected].to_vec(), self.resolution, 0)
            }
        }
    }

    fn is_opened(&self) -> bool {
        self.stream.is_some() && !self.lost
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn release(&mut self) {
        // buffers must be unmapped before the device handle goes away
        self.stream.take();
        self.device.take();
    }
}
