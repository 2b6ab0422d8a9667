use crate::{config::ModelConfig, error::PreprocessError};
use image::{
    imageops::{self, FilterType},
    DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage,
};
use ndarray::Array4;
use std::time::{Duration, Instant};

const RESAMPLING_FILTER: FilterType = FilterType::CatmullRom;

#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pub tensor: Array4<f32>,
    pub original_width: u32,
    pub original_height: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    max_bytes: usize,
    accepted_formats: Vec<ImageFormat>,
}

impl ImagePreprocessor {
    pub fn new(model_config: &ModelConfig, max_bytes: usize, accepted_formats: Vec<ImageFormat>) -> Self {
        Self {
            image_size: model_config.image_size,
            mean: model_config.mean,
            std: model_config.std,
            max_bytes,
            accepted_formats,
        }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Cheap checks run before anything is decoded or allocated.
    pub fn validate(&self, image_data: &[u8]) -> Result<ImageFormat, PreprocessError> {
        if image_data.is_empty() {
            return Err(PreprocessError::Empty);
        }
        if image_data.len() > self.max_bytes {
            return Err(PreprocessError::TooLarge {
                size: image_data.len(),
                max: self.max_bytes,
            });
        }

        let format = image::guess_format(image_data)
            .map_err(|_| PreprocessError::UnsupportedFormat("unrecognized encoding".to_string()))?;
        if !self.accepted_formats.contains(&format) {
            return Err(PreprocessError::UnsupportedFormat(format!("{:?}", format)));
        }

        Ok(format)
    }

    /// Decodes bytes already accepted by [`Self::validate`] as `format`.
    pub fn preprocess(
        &self,
        image_data: &[u8],
        format: ImageFormat,
    ) -> Result<PreprocessedImage, PreprocessError> {
        let start = Instant::now();
        let image = image::load_from_memory_with_format(image_data, format)?;
        let (original_width, original_height) = image.dimensions();

        let canvas = self.letterbox(&image);
        let tensor = self.to_planar_tensor(&canvas);

        let elapsed = start.elapsed();
        tracing::debug!(
            original_width,
            original_height,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "image preprocessed"
        );

        Ok(PreprocessedImage {
            tensor,
            original_width,
            original_height,
            elapsed,
        })
    }

    /// Runs [`Self::preprocess`] on the blocking pool.
    pub async fn preprocess_async(
        &self,
        image_data: std::sync::Arc<[u8]>,
        format: ImageFormat,
    ) -> Result<PreprocessedImage, PreprocessError> {
        let preprocessor = self.clone();
        tokio::task::spawn_blocking(move || preprocessor.preprocess(&image_data, format))
            .await
            .map_err(|e| PreprocessError::Worker(e.to_string()))?
    }

    fn letterbox(&self, image: &DynamicImage) -> RgbaImage {
        let size = self.image_size;
        let (width, height) = image.dimensions();
        let scale = f32::min(size as f32 / width as f32, size as f32 / height as f32);

        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, size);

        let resized = imageops::resize(&image.to_rgba8(), scaled_width, scaled_height, RESAMPLING_FILTER);

        let mut canvas = RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 255]));
        let offset_x = (size - scaled_width) / 2;
        let offset_y = (size - scaled_height) / 2;
        imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

        canvas
    }

    fn to_planar_tensor(&self, canvas: &RgbaImage) -> Array4<f32> {
        let size = self.image_size as usize;
        let mut input = Array4::zeros((1, 3, size, size));

        for (x, y, pixel) in canvas.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = pixel.0[c] as f32 / 255.;
                input[[0, c, y, x]] = (value - self.mean[c]) / self.std[c];
            }
        }

        input
    }
}
