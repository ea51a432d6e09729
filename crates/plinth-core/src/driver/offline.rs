//! Backend without hardware: the caller pulls blocks.

use super::backend::AudioBackend;
use super::callback::{BlockRenderer, CallbackStatus, ChannelScratch, DeviceErrorSink};
use super::config::DriverConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

struct OfflineStream {
    renderer: BlockRenderer,
    inputs: ChannelScratch,
    outputs: ChannelScratch,
    errors: DeviceErrorSink,
    block_size: usize,
}

#[derive(Default)]
struct OfflineState {
    stream: Option<OfflineStream>,
    forced_sample_rate: Option<f64>,
    fail_next_open: bool,
    opened: usize,
}

/// Backend rendering on the caller's thread.
///
/// Used for tests and offline bounces. Its [`OfflineController`] stays
/// usable after the backend has been handed to a driver.
pub struct OfflineBackend {
    state: Arc<Mutex<OfflineState>>,
}

impl OfflineBackend {
    pub fn new() -> (Self, OfflineController) {
        let state = Arc::new(Mutex::new(OfflineState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            OfflineController { state },
        )
    }

    /// Pretend the device only runs at `sample_rate`.
    pub fn with_sample_rate(sample_rate: f64) -> (Self, OfflineController) {
        let (backend, controller) = Self::new();
        backend.state.lock().forced_sample_rate = Some(sample_rate);
        (backend, controller)
    }
}

impl AudioBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    fn negotiate(&mut self, config: &DriverConfig) -> Result<DriverConfig> {
        let mut negotiated = *config;
        if let Some(rate) = self.state.lock().forced_sample_rate {
            negotiated.sample_rate = rate;
        }
        Ok(negotiated)
    }

    fn open(&mut self, renderer: BlockRenderer) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_open) {
            return Err(Error::Backend("offline device refused to open".into()));
        }

        let config = *renderer.config();
        let stream = OfflineStream {
            inputs: renderer.scratch(config.inputs)?,
            outputs: renderer.scratch(config.outputs)?,
            errors: renderer.error_sink(),
            block_size: config.block_size,
            renderer,
        };
        state.stream = Some(stream);
        state.opened += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().stream = None;
    }
}

/// Test-side handle for an [`OfflineBackend`].
#[derive(Clone)]
pub struct OfflineController {
    state: Arc<Mutex<OfflineState>>,
}

impl OfflineController {
    pub fn is_open(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    /// Streams opened so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Change the block size of subsequent callbacks, as some platforms do.
    pub fn set_block_size(&self, frames: usize) {
        if let Some(stream) = self.state.lock().stream.as_mut() {
            stream.block_size = frames;
        }
    }

    /// Render one block with silent inputs.
    ///
    /// Returns the planar output channels, or `None` when no stream is open.
    /// A block that completes the stream is still returned; the stream is
    /// closed afterwards.
    pub fn render_block(&self) -> Option<Vec<Vec<f32>>> {
        self.render_block_with(&[])
    }

    /// Render one block, feeding `inputs[c]` to input channel `c`.
    ///
    /// Missing channels and samples are silent.
    pub fn render_block_with(&self, inputs: &[&[f32]]) -> Option<Vec<Vec<f32>>> {
        let mut state = self.state.lock();
        let stream = state.stream.as_mut()?;
        let frames = stream.block_size;

        stream.inputs.clear();
        if frames <= stream.inputs.max_frames() {
            for (c, source) in inputs.iter().enumerate().take(stream.inputs.channels()) {
                let n = source.len().min(frames);
                stream.inputs.channel_mut(c, frames)[..n].copy_from_slice(&source[..n]);
            }
        }

        let status = stream
            .renderer
            .render_scratch(frames, &stream.inputs, &mut stream.outputs);

        let block = (0..stream.outputs.channels())
            .map(|c| {
                if frames <= stream.outputs.max_frames() {
                    stream.outputs.channel(c, frames).to_vec()
                } else {
                    vec![0.0; frames]
                }
            })
            .collect();

        if status == CallbackStatus::Complete {
            state.stream = None;
        }
        Some(block)
    }

    /// Simulate the device disappearing mid-stream.
    pub fn fail_device(&self) {
        if let Some(stream) = self.state.lock().stream.as_ref() {
            stream.errors.report();
        }
    }

    /// Make the next `open` fail.
    pub fn fail_next_open(&self) {
        self.state.lock().fail_next_open = true;
    }
}
