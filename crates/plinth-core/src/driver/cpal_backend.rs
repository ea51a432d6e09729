//! CPAL output backend.

use super::backend::AudioBackend;
use super::callback::BlockRenderer;
use super::config::DriverConfig;
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Wrapper to hold a `cpal::Stream` in a `Send` context.
///
/// `cpal::Stream` is `!Send` due to platform internals. The driver only
/// touches its backend from the control thread that owns it, and the stream
/// is dropped by `close` on that same owner.
struct StreamHandle(#[allow(dead_code)] cpal::Stream);

// SAFETY: see above; the stream is never used concurrently.
unsafe impl Send for StreamHandle {}

/// Output stream on a CPAL device.
///
/// Device buffers are interleaved f32, i16 or u16; the callback renders
/// planar f32 into pool-backed scratch and interleaves it. Device channels
/// beyond the configured outputs are silent. Input channels read silence.
pub struct CpalBackend {
    output_device_index: Option<usize>,
    device_channels: usize,
    stream: Option<StreamHandle>,
}

impl CpalBackend {
    pub fn new(output_device_index: Option<usize>) -> Self {
        Self {
            output_device_index,
            device_channels: 0,
            stream: None,
        }
    }

    fn get_device(index: Option<usize>) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(idx) = index {
            let devices: Vec<_> = host.output_devices()?.collect();

            let device_count = devices.len();
            devices.into_iter().nth(idx).ok_or_else(|| {
                Error::InvalidDevice(format!(
                    "Output device index {} out of range (available: {})",
                    idx, device_count
                ))
            })
        } else {
            host.default_output_device()
                .ok_or_else(|| Error::InvalidDevice("No output device available".to_string()))
        }
    }

    /// Channel count of the device after negotiation.
    pub fn device_channels(&self) -> usize {
        self.device_channels
    }

    /// List available output devices.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Result<Vec<String>> = host
            .output_devices()?
            .enumerate()
            .map(|(idx, device)| Ok(format!("{}: {}", idx, device.name()?)))
            .collect();
        devices
    }

    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut renderer: BlockRenderer,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let device_channels = config.channels as usize;
        let inputs = renderer.scratch(renderer.config().inputs)?;
        let mut outputs = renderer.scratch(renderer.config().outputs)?;
        let errors = renderer.error_sink();

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / device_channels;
                renderer.render_scratch(frames, &inputs, &mut outputs);

                let rendered = frames <= outputs.max_frames();
                let channels = outputs.channels();
                for (frame, samples) in data.chunks_mut(device_channels).enumerate() {
                    for (channel, sample) in samples.iter_mut().enumerate() {
                        let value = if rendered && channel < channels {
                            outputs.channel(channel, frames)[frame]
                        } else {
                            0.0
                        };
                        *sample = T::from_sample(value);
                    }
                }
            },
            move |_err| {
                errors.report();
            },
            None,
        )?;

        Ok(stream)
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn negotiate(&mut self, config: &DriverConfig) -> Result<DriverConfig> {
        let device = Self::get_device(self.output_device_index)?;
        let default = device.default_output_config()?;
        let requested_rate = cpal::SampleRate(config.sample_rate as u32);

        let rate_supported = device.supported_output_configs()?.any(|range| {
            range.min_sample_rate() <= requested_rate && requested_rate <= range.max_sample_rate()
        });

        let mut negotiated = *config;
        if !rate_supported {
            negotiated.sample_rate = default.sample_rate().0 as f64;
        }
        if let cpal::SupportedBufferSize::Range { min, max } = default.buffer_size() {
            let (min, max) = (*min as usize, *max as usize);
            negotiated.block_size = negotiated.block_size.clamp(min, max);
            negotiated.max_block_size = negotiated.max_block_size.max(negotiated.block_size);
        }

        self.device_channels = default.channels() as usize;
        Ok(negotiated)
    }

    fn open(&mut self, renderer: BlockRenderer) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = Self::get_device(self.output_device_index)?;
        let default = device.default_output_config()?;
        let driver_config = *renderer.config();

        let config = cpal::StreamConfig {
            channels: default.channels(),
            sample_rate: cpal::SampleRate(driver_config.sample_rate as u32),
            buffer_size: cpal::BufferSize::Fixed(driver_config.block_size as u32),
        };

        let stream = match default.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&device, &config, renderer)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&device, &config, renderer)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&device, &config, renderer)?,
            format => {
                return Err(Error::UnsupportedSampleFormat(format!("{format:?}")));
            }
        };

        stream.play()?;

        self.device_channels = default.channels() as usize;
        self.stream = Some(StreamHandle(stream));
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}
