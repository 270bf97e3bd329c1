use anyhow::Result;
use image::{DynamicImage, ImageFormat};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Rotation needed to display a photo upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// Maps the EXIF orientation tag. Mirrored variants (2, 4, 5, 7) and
    /// unknown values are left as they are.
    pub fn from_exif_value(value: u32) -> Self {
        match value {
            3 => Orientation::Rotate180,
            6 => Orientation::Rotate90,
            8 => Orientation::Rotate270,
            _ => Orientation::Normal,
        }
    }

    pub fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Orientation::Normal => image,
            Orientation::Rotate90 => image.rotate90(),
            Orientation::Rotate180 => image.rotate180(),
            Orientation::Rotate270 => image.rotate270(),
        }
    }
}

/// Reads the orientation of a JPEG source. Other formats are not inspected.
/// A file without EXIF data is `Normal`; unreadable EXIF data is an error.
pub fn read_orientation(path: &Path) -> Result<Orientation> {
    if !matches!(ImageFormat::from_path(path), Ok(ImageFormat::Jpeg)) {
        return Ok(Orientation::Normal);
    }
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(Orientation::Normal),
        Err(err) => return Err(err.into()),
    };
    Ok(exif
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(Orientation::from_exif_value)
        .unwrap_or_default())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{Rgb, RgbImage};
    use std::path::Path;

    /// Inserts an APP1 Exif segment carrying only an Orientation tag right
    /// after the SOI marker of `jpeg`.
    pub fn with_orientation(jpeg: &[u8], value: u16) -> Vec<u8> {
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM\x00\x2A");
        tiff.extend_from_slice(&8u32.to_be_bytes());
        tiff.extend_from_slice(&1u16.to_be_bytes());
        tiff.extend_from_slice(&0x0112u16.to_be_bytes());
        tiff.extend_from_slice(&3u16.to_be_bytes());
        tiff.extend_from_slice(&1u32.to_be_bytes());
        tiff.extend_from_slice(&value.to_be_bytes());
        tiff.extend_from_slice(&[0, 0]);
        tiff.extend_from_slice(&0u32.to_be_bytes());

        let mut payload = b"Exif\x00\x00".to_vec();
        payload.extend_from_slice(&tiff);
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    /// Writes a `width` x `height` JPEG tagged with the given orientation.
    pub fn write_oriented_jpeg(path: &Path, width: u32, height: u32, value: u16) {
        let plain = path.with_extension("plain.jpg");
        RgbImage::from_pixel(width, height, Rgb([90, 60, 30]))
            .save(&plain)
            .unwrap();
        let bytes = std::fs::read(&plain).unwrap();
        std::fs::remove_file(&plain).unwrap();
        std::fs::write(path, with_orientation(&bytes, value)).unwrap();
    }
}
