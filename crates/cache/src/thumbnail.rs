//! Thumbnail rendering and EXIF extraction.
//!
//! Runs on blocking threads; everything here is synchronous CPU work.

use crate::error::CacheResult;
use exif::{In, Tag, Value};
use image::imageops::FilterType;
use lightbox_core::metadata::{GpsCoordinates, PhotoMetadata};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// Target length for the thumbnail's shorter edge.
const SHORT_EDGE: u32 = 256;
/// Cap on the thumbnail's longer edge; anything beyond is center-cropped.
const LONG_EDGE_CAP: u32 = 512;
/// JPEG quality for encoded thumbnails.
const JPEG_QUALITY: u8 = 85;

/// A rendered thumbnail plus the metadata extracted from the same bytes.
#[derive(Clone, Debug)]
pub struct RenderedPhoto {
    /// JPEG-encoded thumbnail.
    pub thumbnail: Vec<u8>,
    /// Metadata of the original image.
    pub metadata: PhotoMetadata,
}

/// Decode a photo, render its thumbnail and extract metadata.
///
/// The thumbnail's shorter edge is scaled to 256px (never upscaled) and the
/// longer edge center-cropped at 512px, so panoramas don't produce mile-wide
/// strips. EXIF extraction is best-effort: missing or malformed EXIF yields
/// `None` fields, never an error.
pub fn render(data: &[u8]) -> CacheResult<RenderedPhoto> {
    let decoded = image::load_from_memory(data)?;
    let (width, height) = (decoded.width(), decoded.height());

    let mut thumb = if width.min(height) > SHORT_EDGE {
        let (new_w, new_h) = if width <= height {
            let scaled = (u64::from(height) * u64::from(SHORT_EDGE) / u64::from(width)) as u32;
            (SHORT_EDGE, scaled.max(1))
        } else {
            let scaled = (u64::from(width) * u64::from(SHORT_EDGE) / u64::from(height)) as u32;
            (scaled.max(1), SHORT_EDGE)
        };
        decoded.resize_exact(new_w, new_h, FilterType::Triangle)
    } else {
        decoded
    };

    let (tw, th) = (thumb.width(), thumb.height());
    if tw.max(th) > LONG_EDGE_CAP {
        thumb = if tw >= th {
            thumb.crop_imm((tw - LONG_EDGE_CAP) / 2, 0, LONG_EDGE_CAP, th)
        } else {
            thumb.crop_imm(0, (th - LONG_EDGE_CAP) / 2, tw, LONG_EDGE_CAP)
        };
    }

    // JPEG has no alpha channel.
    let rgb = image::DynamicImage::ImageRgb8(thumb.to_rgb8());
    let mut encoded = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)?;

    let mut metadata = PhotoMetadata {
        width,
        height,
        taken_at: None,
        camera_make: None,
        camera_model: None,
        gps: None,
    };
    if let Ok(parsed) = exif::Reader::new().read_from_container(&mut std::io::Cursor::new(data)) {
        metadata.taken_at = extract_taken_at(&parsed);
        metadata.camera_make = extract_ascii(&parsed, Tag::Make);
        metadata.camera_model = extract_ascii(&parsed, Tag::Model);
        metadata.gps = extract_gps(&parsed);
    }

    Ok(RenderedPhoto {
        thumbnail: encoded,
        metadata,
    })
}

fn extract_taken_at(exif: &exif::Exif) -> Option<OffsetDateTime> {
    let field = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY))?;
    let raw = match &field.value {
        Value::Ascii(values) => values.first()?,
        _ => return None,
    };
    let dt = exif::DateTime::from_ascii(raw).ok()?;

    let date = Date::from_calendar_date(
        i32::from(dt.year),
        Month::try_from(dt.month).ok()?,
        dt.day,
    )
    .ok()?;
    let clock = Time::from_hms(dt.hour, dt.minute, dt.second).ok()?;
    // Cameras record local time without a zone more often than not; treat the
    // offset as UTC when absent.
    let offset = dt
        .offset
        .and_then(|minutes| UtcOffset::from_whole_seconds(i32::from(minutes) * 60).ok())
        .unwrap_or(UtcOffset::UTC);
    Some(PrimitiveDateTime::new(date, clock).assume_offset(offset))
}

fn extract_ascii(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let raw = match &field.value {
        Value::Ascii(values) => values.first()?,
        _ => return None,
    };
    let text = String::from_utf8_lossy(raw)
        .trim_matches(char::from(0))
        .trim()
        .to_string();
    (!text.is_empty()).then_some(text)
}

fn extract_gps(exif: &exif::Exif) -> Option<GpsCoordinates> {
    let latitude = gps_degrees(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S")?;
    let longitude = gps_degrees(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W")?;
    Some(GpsCoordinates {
        latitude,
        longitude,
    })
}

fn gps_degrees(
    exif: &exif::Exif,
    coord_tag: Tag,
    ref_tag: Tag,
    negative_ref: &str,
) -> Option<f64> {
    let field = exif.get_field(coord_tag, In::PRIMARY)?;
    let parts = match &field.value {
        Value::Rational(values) if values.len() >= 3 => values,
        _ => return None,
    };
    let degrees = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;

    let sign = match extract_ascii(exif, ref_tag) {
        Some(r) if r.eq_ignore_ascii_case(negative_ref) => -1.0,
        _ => 1.0,
    };
    Some(degrees * sign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn thumb_dimensions(jpeg: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(jpeg).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn test_landscape_scales_shorter_edge() {
        let rendered = render(&png_bytes(800, 600)).unwrap();
        assert_eq!(rendered.metadata.width, 800);
        assert_eq!(rendered.metadata.height, 600);

        let (w, h) = thumb_dimensions(&rendered.thumbnail);
        assert_eq!(h, 256);
        assert_eq!(w, 341); // 800 * 256 / 600
    }

    #[test]
    fn test_panorama_is_center_cropped() {
        let rendered = render(&png_bytes(3000, 500)).unwrap();
        let (w, h) = thumb_dimensions(&rendered.thumbnail);
        assert_eq!(h, 256);
        assert_eq!(w, 512);
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let rendered = render(&png_bytes(120, 90)).unwrap();
        let (w, h) = thumb_dimensions(&rendered.thumbnail);
        assert_eq!((w, h), (120, 90));
    }

    #[test]
    fn test_no_exif_yields_empty_metadata() {
        let rendered = render(&png_bytes(64, 64)).unwrap();
        assert!(rendered.metadata.taken_at.is_none());
        assert!(rendered.metadata.camera_make.is_none());
        assert!(rendered.metadata.gps.is_none());
    }

    #[test]
    fn test_garbage_bytes_are_an_error() {
        assert!(render(b"not an image at all").is_err());
    }
}
