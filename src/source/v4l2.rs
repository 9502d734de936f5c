//! V4L2 camera platform.
//!
//! Enumerates `/dev/video*` nodes through libv4l and streams RGB24 frames via
//! an mmap buffer queue. V4L2 has no notion of lens facing, so every node is
//! reported as `External`; the lens resolver's fallback tiers pick it up for
//! front/back requests.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{CameraPlatform, DeviceBinding, FrameShaper};
use crate::config::CameraSettings;
use crate::frame::{Frame, Spectrum};
use crate::lens::{DeviceDescriptor, LensFacing};

pub struct V4l2Platform {
    /// Restrict the inventory to one device path.
    pinned: Option<String>,
}

impl V4l2Platform {
    pub fn new(pinned: Option<String>) -> Self {
        Self { pinned }
    }
}

impl CameraPlatform for V4l2Platform {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = v4l::context::enum_devices()
            .into_iter()
            .map(|node| {
                let id = node.path().display().to_string();
                DeviceDescriptor {
                    facing: LensFacing::External,
                    name: node.name().unwrap_or_else(|| id.clone()),
                    supported: v4l::Device::with_path(node.path()).is_ok(),
                    id,
                }
            })
            .filter(|device| {
                self.pinned
                    .as_deref()
                    .map(|pinned| pinned == device.id)
                    .unwrap_or(true)
            })
            .collect();
        Ok(devices)
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        settings: &CameraSettings,
    ) -> Result<Box<dyn DeviceBinding>> {
        let mut binding = V4l2Binding {
            device: device.clone(),
            state: None,
            frame_count: 0,
            active_width: settings.width,
            active_height: settings.height,
            shaper: FrameShaper::new(settings),
        };
        binding.connect(settings)?;
        Ok(Box::new(binding))
    }
}

struct V4l2Binding {
    device: DeviceDescriptor,
    state: Option<V4l2StreamState>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
    /// V4L2 exposes neither rotation nor a portable zoom control, so both are
    /// applied in software.
    shaper: FrameShaper,
}

#[self_referencing]
struct V4l2StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Binding {
    fn connect(&mut self, settings: &CameraSettings) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device.id)
            .with_context(|| format!("open v4l2 device {}", self.device.id))?;
        let (width, height) = settings.capture_size();
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Platform: failed to set format on {}: {}",
                    self.device.id,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "device {} does not stream RGB24 (got {})",
                self.device.id,
                format.fourcc
            ));
        }

        if settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Platform: failed to set fps on {}: {}",
                    self.device.id,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = V4l2StreamStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Platform: bound {} ({}x{})",
            self.device.id,
            self.active_width,
            self.active_height
        );
        Ok(())
    }
}

impl DeviceBinding for V4l2Binding {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn next_frame(&mut self) -> Result<(Spectrum, Frame)> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not bound")?;
        let (buf, _meta) = state
            .with_mut(|fields| fields.stream.next())
            .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;

        let (pixels, width, height) =
            self.shaper.shape(buf.to_vec(), self.active_width, self.active_height)?;
        self.frame_count += 1;
        Ok((
            Spectrum::Rgb,
            Frame::new(pixels, width, height, self.frame_count),
        ))
    }

    fn release(&mut self) -> Result<()> {
        if self.state.take().is_some() {
            log::info!("V4l2Platform: released {}", self.device.id);
        }
        Ok(())
    }
}
