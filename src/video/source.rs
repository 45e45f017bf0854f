//! Source identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Addressable origin of a frame sequence
///
/// Resolved once from user input; backends match on the variant and never
/// re-interpret the original string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// Capture device index (`/dev/video<N>`)
    Device(u32),
    /// Local file or directory
    Path(PathBuf),
    /// Network URL
    Url(String),
}

impl SourceId {
    /// Resolve a user supplied identifier.
    ///
    /// A string that parses as a non-negative integer is a device index,
    /// one containing `://` is a URL, anything else is a path.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(index) = raw.parse::<u32>() {
            return SourceId::Device(index);
        }
        if raw.contains("://") {
            return SourceId::Url(raw.to_string());
        }
        SourceId::Path(PathBuf::from(raw))
    }

    /// URL scheme in lowercase, for URL sources
    pub fn scheme(&self) -> Option<String> {
        match self {
            SourceId::Url(url) => url.split_once("://").map(|(s, _)| s.to_ascii_lowercase()),
            _ => None,
        }
    }

    /// Path of a file or device node source
    pub fn path(&self) -> Option<&Path> {
        match self {
            SourceId::Path(path) => Some(path.as_path()),
            _ => None,
        }
    }

    /// Whether this names a V4L2 device (index or `/dev/...` node)
    pub fn is_device(&self) -> bool {
        match self {
            SourceId::Device(_) => true,
            SourceId::Path(path) => path.starts_with("/dev"),
            SourceId::Url(_) => false,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Device(index) => write!(f, "device:{}", index),
            SourceId::Path(path) => write!(f, "{}", path.display()),
            SourceId::Url(url) => write!(f, "{}", url),
        }
    }
}

impl From<u32> for SourceId {
    fn from(index: u32) -> Self {
        SourceId::Device(index)
    }
}

impl From<&str> for SourceId {
    fn from(raw: &str) -> Self {
        SourceId::parse(raw)
    }
}

impl From<String> for SourceId {
    fn from(raw: String) -> Self {
        SourceId::parse(&raw)
    }
}

impl From<PathBuf> for SourceId {
    fn from(path: PathBuf) -> Self {
        SourceId::Path(path)
    }
}
