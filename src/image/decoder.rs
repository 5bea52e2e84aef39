use crate::error::DecodeError;
use image::{DynamicImage, GenericImageView};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    Rgba8(Vec<u8>),
}

/// A page ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixel_data: PixelData,
}

impl DecodedImage {
    pub fn byte_size(&self) -> usize {
        match &self.pixel_data {
            PixelData::Rgba8(data) => data.len(),
        }
    }
}

/// Turns encoded image bytes into a [`DecodedImage`].
///
/// Implementations are called from blocking worker threads, never from the
/// async runtime directly.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, DecodeError>;

    fn decode_file(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        let data = std::fs::read(path)?;
        self.decode(&data)
    }
}

/// Decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterDecoder;

impl Decoder for RasterDecoder {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, DecodeError> {
        if data.len() >= 8 {
            tracing::trace!(bytes = data.len(), header = ?&data[0..8], "Decoding from memory");
        }
        let img = image::load_from_memory(data)?;
        Ok(process_dynamic_image(img))
    }

    /// Sniffs the format from content; scratch files carry no extension.
    fn decode_file(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        let img = image::ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(process_dynamic_image(img))
    }
}

fn process_dynamic_image(img: DynamicImage) -> DecodedImage {
    let (width, height) = img.dimensions();
    let rgba = img.to_rgba8();
    DecodedImage {
        width,
        height,
        pixel_data: PixelData::Rgba8(rgba.into_raw()),
    }
}
