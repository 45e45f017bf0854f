//! File capture backend
//!
//! Finite sources read from disk:
//! - `.mjpg` / `.mjpeg` files holding concatenated JPEG images
//! - directories of still images, played in file name order
//! - a single still image, played as a one-frame sequence

use bytes::Bytes;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{BackendKind, CaptureBackend, CaptureStream, OpenRequest};
use crate::error::{AppError, Result};
use crate::video::decoder::{split_jpegs, MjpegDecoder};
use crate::video::frame::VideoFrame;
use crate::video::source::SourceId;

const MJPEG_EXTENSIONS: &[&str] = &["mjpg", "mjpeg"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Opens local files and image directories
pub struct FileBackend {
    /// Playback rate reported for files, which carry no timing of their own
    default_fps: f64,
}

impl FileBackend {
    pub fn new(default_fps: f64) -> Self {
        Self { default_fps }
    }
}

fn extension_in(path: &Path, set: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| set.iter().any(|s| s.eq_ignore_ascii_case(e)))
}

impl CaptureBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn supports(&self, id: &SourceId) -> bool {
        matches!(id, SourceId::Path(_)) && !id.is_device()
    }

    fn open(&self, id: &SourceId, _request: &OpenRequest) -> Result<Box<dyn CaptureStream>> {
        let path = id
            .path()
            .ok_or_else(|| AppError::Unsupported(format!("{} is not a file", id)))?;

        let frames = if path.is_dir() {
            FrameStore::images_in(path)?
        } else if extension_in(path, MJPEG_EXTENSIONS) {
            FrameStore::mjpeg(path)?
        } else if path.is_file() {
            FrameStore::Images(vec![path.to_path_buf()])
        } else {
            return Err(AppError::VideoError(format!("{} does not exist", path.display())));
        };

        if frames.len() == 0 {
            return Err(AppError::VideoError(format!(
                "{} contains no frames",
                path.display()
            )));
        }

        info!("Opened {} ({} frames)", path.display(), frames.len());
        Ok(Box::new(FileStream {
            frames,
            position: 0,
            decoder: None,
            fps: self.default_fps,
            opened: true,
        }))
    }
}

/// Where the frames of a file source live
enum FrameStore {
    /// Whole MJPEG file in memory plus the byte range of each image
    Jpeg { data: Bytes, ranges: Vec<Range<usize>> },
    /// One still image per frame
    Images(Vec<PathBuf>),
}

impl FrameStore {
    fn mjpeg(path: &Path) -> Result<Self> {
        let data = Bytes::from(std::fs::read(path)?);
        let ranges = split_jpegs(&data);
        Ok(FrameStore::Jpeg { data, ranges })
    }

    fn images_in(dir: &Path) -> Result<Self> {
        let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && extension_in(p, IMAGE_EXTENSIONS))
            .collect();
        images.sort();
        Ok(FrameStore::Images(images))
    }

    fn len(&self) -> usize {
        match self {
            FrameStore::Jpeg { ranges, .. } => ranges.len(),
            FrameStore::Images(paths) => paths.len(),
        }
    }
}

pub struct FileStream {
    frames: FrameStore,
    position: u64,
    decoder: Option<MjpegDecoder>,
    fps: f64,
    opened: bool,
}

impl FileStream {
    fn decode(&mut self, index: usize) -> Result<VideoFrame> {
        match &self.frames {
            FrameStore::Jpeg { data, ranges } => {
                let decoder = match &mut self.decoder {
                    Some(decoder) => decoder,
                    slot @ None => slot.insert(MjpegDecoder::new()?),
                };
                decoder.decode(&data[ranges[index].clone()], 0)
            }
            FrameStore::Images(paths) => {
                let path = &paths[index];
                let image = image::open(path)
                    .map_err(|e| {
                        AppError::ReadFailure(format!("Failed to decode {}: {}", path.display(), e))
                    })?
                    .to_rgb8();
                Ok(VideoFrame::from_image(image, 0))
            }
        }
    }
}

impl CaptureStream for FileStream {
    fn read(&mut self) -> Result<VideoFrame> {
        if !self.opened {
            return Err(AppError::ReadFailure("file released".to_string()));
        }
        let index = self.position as usize;
        if index >= self.frames.len() {
            return Err(AppError::EndOfStream);
        }
        let frame = self.decode(index);
        // a corrupt frame is skipped rather than retried forever
        self.position += 1;
        frame
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.position = frame.min(self.frames.len() as u64);
        Ok(())
    }

    fn release(&mut self) {
        self.opened = false;
        self.frames = FrameStore::Images(Vec::new());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::video::format::Resolution;
    use crate::video::decoder::mjpeg::tests::sample_jpeg;
    use std::io::Write;

    fn request() -> OpenRequest {
        OpenRequest {
            resolution: Resolution::DEFAULT,
            fps: None,
        }
    }

    pub(crate) fn write_mjpeg(dir: &Path, colors: &[[u8; 3]]) -> PathBuf {
        let path = dir.join("clip.mjpg");
        let mut file = std::fs::File::create(&path).unwrap();
        for color in colors {
            file.write_all(&sample_jpeg(*color, 32, 24)).unwrap();
        }
        path
    }

    #[test]
    fn test_mjpeg_file_plays_and_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mjpeg(dir.path(), &[[255, 0, 0], [0, 0, 255]]);
        let backend = FileBackend::new(30.0);
        let mut stream = backend.open(&SourceId::Path(path), &request()).unwrap();

        assert_eq!(stream.frame_count(), Some(2));
        assert_eq!(stream.fps(), Some(30.0));
        let first = stream.read().unwrap();
        assert_eq!(first.resolution, Resolution::new(32, 24));
        assert!(first.pixel(4, 4).unwrap()[0] > 200);
        let second = stream.read().unwrap();
        assert!(second.pixel(4, 4).unwrap()[2] > 200);
        assert!(stream.read().unwrap_err().is_end_of_stream());
        assert_eq!(stream.position(), 2);
    }

    #[test]
    fn test_seek_to_start_replays_first_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mjpeg(dir.path(), &[[255, 0, 0], [0, 255, 0]]);
        let mut stream = FileBackend::new(30.0)
            .open(&SourceId::Path(path), &request())
            .unwrap();

        let first = stream.read().unwrap();
        stream.read().unwrap();
        assert!(stream.read().is_err());
        stream.seek(0).unwrap();
        let again = stream.read().unwrap();
        assert_eq!(again.data(), first.data());
    }

    #[test]
    fn test_image_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, color) in [("b.jpg", [0u8, 255, 0]), ("a.jpg", [255, 0, 0])] {
            std::fs::write(dir.path().join(name), sample_jpeg(color, 16, 16)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut stream = FileBackend::new(10.0)
            .open(&SourceId::Path(dir.path().to_path_buf()), &request())
            .unwrap();
        assert_eq!(stream.frame_count(), Some(2));
        assert!(stream.read().unwrap().pixel(8, 8).unwrap()[0] > 200);
        assert!(stream.read().unwrap().pixel(8, 8).unwrap()[1] > 200);
    }

    #[test]
    fn test_missing_and_empty_sources() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(30.0);
        let missing = SourceId::Path(dir.path().join("nope.mjpg"));
        assert!(backend.open(&missing, &request()).is_err());
        let empty = SourceId::Path(dir.path().to_path_buf());
        assert!(backend.open(&empty, &request()).is_err());
    }

    #[test]
    fn test_release_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mjpeg(dir.path(), &[[1, 2, 3]]);
        let mut stream = FileBackend::new(30.0)
            .open(&SourceId::Path(path), &request())
            .unwrap();
        stream.release();
        assert!(!stream.is_opened());
        assert!(stream.read().is_err());
    }
}
