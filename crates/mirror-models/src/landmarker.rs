//! Five-point landmarks from a second SCRFD pass over the face region.

use crate::scrfd::Scrfd;
use image::{imageops, GrayImage};
use mirror_core::{FaceInfo, Keypoints, Landmarker, LandmarkerFactory, ProviderError};
use std::path::Path;

/// Fraction of the box size added on every side before cropping.
const CROP_MARGIN: f32 = 0.5;

/// Pixel rectangle `(x, y, width, height)` around `face`, clamped to the image.
fn crop_region(face: &FaceInfo, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
    let mx = face.width.max(0.0) * CROP_MARGIN;
    let my = face.height.max(0.0) * CROP_MARGIN;
    let x0 = (face.x - mx).floor().clamp(0.0, image_width as f32) as u32;
    let y0 = (face.y - my).floor().clamp(0.0, image_height as f32) as u32;
    let x1 = (face.x + face.width + mx).ceil().clamp(0.0, image_width as f32) as u32;
    let y1 = (face.y + face.height + my).ceil().clamp(0.0, image_height as f32) as u32;
    (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

pub struct ScrfdLandmarker {
    model_file: &'static str,
    model: Option<Scrfd>,
}

impl ScrfdLandmarker {
    pub fn new(model_file: &'static str) -> Self {
        Self {
            model_file,
            model: None,
        }
    }
}

impl Landmarker for ScrfdLandmarker {
    fn name(&self) -> &str {
        "scrfd-kps"
    }

    fn load_model(&mut self, root: &Path) -> Result<(), ProviderError> {
        self.model = Some(Scrfd::load(&root.join(self.model_file))?);
        Ok(())
    }

    fn extract_keypoints(
        &mut self,
        image: &GrayImage,
        face: &FaceInfo,
    ) -> Result<Keypoints, ProviderError> {
        let model = self.model.as_mut().ok_or(ProviderError::NotLoaded)?;
        let (x, y, w, h) =
            crop_region(face, image.width(), image.height()).ok_or(ProviderError::NoFace)?;
        let crop = imageops::crop_imm(image, x, y, w, h).to_image();

        let best = model
            .run(&crop)?
            .into_iter()
            .next()
            .ok_or(ProviderError::NoFace)?;

        Ok(best.keypoints.map(|(kx, ky)| (kx + x as f32, ky + y as f32)))
    }
}

pub struct ScrfdLandmarkerFactory {
    pub model_file: &'static str,
}

impl LandmarkerFactory for ScrfdLandmarkerFactory {
    fn create_landmarker(&self) -> Box<dyn Landmarker> {
        Box::new(ScrfdLandmarker::new(self.model_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> FaceInfo {
        FaceInfo { x, y, width: w, height: h, score: 0.9 }
    }

    #[test]
    fn test_crop_region_expands_by_margin() {
        assert_eq!(crop_region(&face(100.0, 100.0, 40.0, 60.0), 640, 480), Some((80, 70, 80, 120)));
    }

    #[test]
    fn test_crop_region_is_clamped_to_image() {
        assert_eq!(crop_region(&face(-10.0, 5.0, 40.0, 40.0), 50, 50), Some((0, 0, 50, 50)));
    }

    #[test]
    fn test_crop_region_outside_image_is_none() {
        assert_eq!(crop_region(&face(700.0, 10.0, 20.0, 20.0), 640, 480), None);
        assert_eq!(crop_region(&face(10.0, 10.0, 0.0, 0.0), 640, 480), None);
    }

    #[test]
    fn test_extract_before_load_is_rejected() {
        let mut landmarker = ScrfdLandmarker::new("det_10g.onnx");
        let image = GrayImage::new(64, 64);
        let result = landmarker.extract_keypoints(&image, &face(10.0, 10.0, 20.0, 20.0));
        assert!(matches!(result, Err(ProviderError::NotLoaded)));
    }
}
