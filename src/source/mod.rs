//! Platform camera subsystem.
//!
//! A `CameraPlatform` enumerates devices and opens bindings; a bound
//! `DeviceBinding` produces frames until released. Device ids starting with
//! `stub://` select the synthetic platform, which needs no hardware.

use anyhow::{Context, Result};
use image::{imageops, RgbImage};

use crate::config::CameraSettings;
use crate::frame::{Frame, Spectrum};
use crate::lens::DeviceDescriptor;

pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticPlatform, SyntheticStats};
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Platform;

pub trait CameraPlatform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current device inventory. May be empty, and may list devices that
    /// cannot actually stream (`supported == false`).
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    fn open(
        &self,
        device: &DeviceDescriptor,
        settings: &CameraSettings,
    ) -> Result<Box<dyn DeviceBinding>>;
}

/// An open device. Dropping a binding without `release` still frees it, but
/// `release` reports errors.
pub trait DeviceBinding: Send {
    fn device(&self) -> &DeviceDescriptor;

    /// True for RGB + infrared sensors whose frames must be paired.
    fn is_dual(&self) -> bool {
        false
    }

    fn next_frame(&mut self) -> Result<(Spectrum, Frame)>;

    fn release(&mut self) -> Result<()>;
}

/// Digital zoom and sensor rotation applied to every captured RGB buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameShaper {
    zoom: f32,
    rotation: u16,
}

impl FrameShaper {
    pub fn new(settings: &CameraSettings) -> Self {
        Self {
            zoom: settings.zoom_ratio(),
            rotation: settings.rotation % 360,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.zoom <= 1.0 && self.rotation == 0
    }

    /// Dimensions of a shaped frame captured at `width` x `height`.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        match self.rotation {
            90 | 270 => (height, width),
            _ => (width, height),
        }
    }

    /// Zoom into the centre of `pixels` (RGB24), then rotate clockwise.
    pub fn shape(
        &self,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<(Vec<u8>, u32, u32)> {
        if self.is_identity() {
            return Ok((pixels, width, height));
        }
        let mut image = RgbImage::from_raw(width, height, pixels)
            .context("frame buffer shorter than its dimensions")?;
        if self.zoom > 1.0 {
            let crop_w = ((width as f32 / self.zoom) as u32).max(1);
            let crop_h = ((height as f32 / self.zoom) as u32).max(1);
            let cropped = imageops::crop_imm(
                &image,
                (width - crop_w) / 2,
                (height - crop_h) / 2,
                crop_w,
                crop_h,
            )
            .to_image();
            image = imageops::resize(&cropped, width, height, imageops::FilterType::Nearest);
        }
        let image = match self.rotation {
            90 => imageops::rotate90(&image),
            180 => imageops::rotate180(&image),
            270 => imageops::rotate270(&image),
            _ => image,
        };
        let (width, height) = image.dimensions();
        Ok((image.into_raw(), width, height))
    }
}

/// Pick the platform for the configured camera.
pub fn platform_for(settings: &CameraSettings) -> Box<dyn CameraPlatform> {
    let pinned = settings.device.as_deref().unwrap_or("stub://front_camera");
    if pinned.starts_with("stub://") {
        return Box::new(SyntheticPlatform::with_device(
            settings.facing,
            pinned.to_string(),
        ));
    }
    #[cfg(feature = "camera-v4l2")]
    {
        Box::new(V4l2Platform::new(Some(pinned.to_string())))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        log::warn!(
            "camera {} requested but built without camera-v4l2, using synthetic camera",
            pinned
        );
        Box::new(SyntheticPlatform::with_device(
            settings.facing,
            format!("stub://{}", pinned.trim_start_matches('/')),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(rotation: u16, linear_zoom: f32) -> CameraSettings {
        CameraSettings {
            rotation,
            linear_zoom,
            ..CameraSettings::default()
        }
    }

    #[test]
    fn default_settings_leave_frames_untouched() {
        let shaper = FrameShaper::new(&CameraSettings::default());
        assert!(shaper.is_identity());
        let (pixels, w, h) = shaper.shape(vec![7; 4 * 2 * 3], 4, 2).expect("shape");
        assert_eq!((w, h), (4, 2));
        assert_eq!(pixels, vec![7; 24]);
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let shaper = FrameShaper::new(&settings(90, 0.0));
        assert_eq!(shaper.output_size(4, 2), (2, 4));
        // Top-left pixel of a 4x2 frame ends up top-right after a clockwise turn.
        let mut pixels = vec![0u8; 4 * 2 * 3];
        pixels[..3].copy_from_slice(&[255, 255, 255]);
        let (rotated, w, h) = shaper.shape(pixels, 4, 2).expect("shape");
        assert_eq!((w, h), (2, 4));
        assert_eq!(&rotated[3..6], &[255, 255, 255]);
        assert_eq!(&rotated[..3], &[0, 0, 0]);
    }

    #[test]
    fn full_zoom_magnifies_the_centre() {
        let shaper = FrameShaper::new(&settings(0, 1.0));
        // 8x8 frame, bright 2x2 block in the middle; 4x zoom fills the frame with it.
        let mut image = RgbImage::new(8, 8);
        for (x, y) in [(3, 3), (3, 4), (4, 3), (4, 4)] {
            image.put_pixel(x, y, image::Rgb([200, 200, 200]));
        }
        let (pixels, w, h) = shaper.shape(image.into_raw(), 8, 8).expect("shape");
        assert_eq!((w, h), (8, 8));
        assert!(pixels.iter().all(|&p| p == 200));
    }

    #[test]
    fn short_buffer_is_an_error() {
        let shaper = FrameShaper::new(&settings(180, 0.0));
        assert!(shaper.shape(vec![0; 5], 4, 2).is_err());
    }
}
