//! Photo metadata carried alongside thumbnails.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// GPS coordinates from EXIF data.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Metadata extracted from a photo's bytes.
///
/// Extracted exactly once per unique content digest and stored next to the
/// thumbnail in the digest store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhotoMetadata {
    /// Pixel width of the original image.
    pub width: u32,
    /// Pixel height of the original image.
    pub height: u32,
    /// Capture date from EXIF, if present.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub taken_at: Option<OffsetDateTime>,
    /// Camera manufacturer from EXIF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    /// Camera model from EXIF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
    /// GPS position from EXIF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsCoordinates>,
}
