//! Per-block rendering on the audio thread.

use super::config::{DriverConfig, MAX_CHANNELS};
use super::cpu::CpuMeter;
use super::DriverState;
use crate::handle::AtomicHandle;
use crate::lockfree::AtomicFlag;
use crate::memory::{PooledBuffer, RtAllocator};
use crate::{rt, Result};
use core::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Timing context for one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessInfo {
    pub frames: usize,
    pub sample_rate: f64,
    /// Frames rendered before this block.
    pub position: u64,
}

/// Whatever renders audio for the driver.
///
/// Called once per block on the audio thread with planar channel slices of
/// `info.frames` samples each. Outputs arrive zeroed. Implementations must not
/// block or allocate outside pre-warmed pools.
pub trait BlockProcessor: Send + Sync {
    fn process(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], info: &ProcessInfo);
}

impl<F> BlockProcessor for F
where
    F: Fn(&[&[f32]], &mut [&mut [f32]], &ProcessInfo) + Send + Sync,
{
    #[inline]
    fn process(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], info: &ProcessInfo) {
        self(inputs, outputs, info)
    }
}

/// Processor that leaves its outputs silent.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl BlockProcessor for Silence {
    fn process(&self, _inputs: &[&[f32]], _outputs: &mut [&mut [f32]], _info: &ProcessInfo) {}
}

/// Slot through which a processor is published to the audio thread.
pub type ProcessorHandle = AtomicHandle<Box<dyn BlockProcessor>>;

/// What the backend should do after a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Continue,
    /// A stop was requested; this block was silent and the stream may end.
    Complete,
}

/// State shared between the driver, its renderer and device error callbacks.
pub(crate) struct DriverShared {
    pub(crate) state: AtomicU8,
    pub(crate) stop_requested: AtomicFlag,
    pub(crate) device_failed: AtomicFlag,
    pub(crate) block_size: AtomicUsize,
    pub(crate) position: AtomicU64,
    pub(crate) overruns: AtomicU64,
    pub(crate) panics: AtomicU64,
    /// Odd while a block may hold the published processor, even between
    /// blocks. Streams render one block at a time.
    pub(crate) render_epoch: AtomicU64,
    pub(crate) cpu: CpuMeter,
}

impl DriverShared {
    pub(crate) fn new(sample_rate: f64) -> Self {
        Self {
            state: AtomicU8::new(DriverState::Uninitialized as u8),
            stop_requested: AtomicFlag::new(false),
            device_failed: AtomicFlag::new(false),
            block_size: AtomicUsize::new(0),
            position: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            render_epoch: AtomicU64::new(0),
            cpu: CpuMeter::new(sample_rate),
        }
    }
}

/// Reports device failures from a backend's error callback.
#[derive(Clone)]
pub struct DeviceErrorSink {
    shared: Arc<DriverShared>,
}

impl DeviceErrorSink {
    /// Mark the stream dead. Lock-free and allocation-free.
    pub fn report(&self) {
        self.shared.stop_requested.set(true);
        if self
            .shared
            .state
            .compare_exchange(
                DriverState::Running as u8,
                DriverState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.shared.device_failed.set(true);
        }
    }
}

/// Renders blocks for a backend stream.
///
/// Owned by the backend's callback closure; everything it touches per block
/// is atomic or pre-allocated.
pub struct BlockRenderer {
    shared: Arc<DriverShared>,
    processor: Arc<ProcessorHandle>,
    allocator: Arc<dyn RtAllocator>,
    config: DriverConfig,
}

impl BlockRenderer {
    pub(crate) fn new(
        shared: Arc<DriverShared>,
        processor: Arc<ProcessorHandle>,
        allocator: Arc<dyn RtAllocator>,
        config: DriverConfig,
    ) -> Self {
        Self {
            shared,
            processor,
            allocator,
            config,
        }
    }

    /// Negotiated stream configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn error_sink(&self) -> DeviceErrorSink {
        DeviceErrorSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Planar scratch for `channels` at the maximum block size, from the
    /// driver's pool. Call from `AudioBackend::open`, not from the callback.
    pub fn scratch(&self, channels: usize) -> Result<ChannelScratch> {
        ChannelScratch::new(
            Arc::clone(&self.allocator),
            channels,
            self.config.max_block_size,
        )
    }

    /// Render one block into `outputs`.
    ///
    /// All output slices must have the same length; that length is the block
    /// size. Outputs are zeroed before the processor runs, so every failure
    /// path leaves silence behind.
    pub fn render(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> CallbackStatus {
        let _audio_thread = rt::AudioThreadScope::enter();

        let frames = outputs
            .first()
            .map(|ch| ch.len())
            .or_else(|| inputs.first().map(|ch| ch.len()))
            .unwrap_or(0);

        for channel in outputs.iter_mut() {
            channel.fill(0.0);
        }

        if self.shared.stop_requested.get() {
            return CallbackStatus::Complete;
        }

        if self.shared.block_size.load(Ordering::Relaxed) != frames {
            self.shared.block_size.store(frames, Ordering::Relaxed);
        }

        let position = self.shared.position.load(Ordering::Relaxed);
        let timer = self.shared.cpu.is_enabled().then(Instant::now);

        if frames > self.config.max_block_size {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.render_epoch.fetch_add(1, Ordering::Relaxed);
            // Pairs with the fence in AudioDriver::retire: either the driver
            // sees this block in flight or this block sees the new processor.
            fence(Ordering::SeqCst);
            match self.processor.get() {
                Some(processor) => {
                    let info = ProcessInfo {
                        frames,
                        sample_rate: self.config.sample_rate,
                        position,
                    };
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        processor.process(inputs, outputs, &info)
                    }));

                    if result.is_err() {
                        // Panic in processor - output silence
                        for channel in outputs.iter_mut() {
                            channel.fill(0.0);
                        }
                        self.shared.panics.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    self.shared.overruns.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.shared.render_epoch.fetch_add(1, Ordering::Release);
        }

        self.shared
            .position
            .store(position + frames as u64, Ordering::Relaxed);
        if let Some(start) = timer {
            self.shared.cpu.record(frames, start.elapsed());
        }

        CallbackStatus::Continue
    }

    /// Render one block through planar scratch buffers.
    ///
    /// Binds the first `frames` samples of each channel and calls
    /// [`render`](Self::render). Blocks larger than the scratch are not
    /// rendered; the outputs are cleared and an overrun is counted.
    pub fn render_scratch(
        &mut self,
        frames: usize,
        inputs: &ChannelScratch,
        outputs: &mut ChannelScratch,
    ) -> CallbackStatus {
        if frames == 0 {
            return if self.shared.stop_requested.get() {
                CallbackStatus::Complete
            } else {
                CallbackStatus::Continue
            };
        }

        if frames > inputs.max_frames || frames > outputs.max_frames {
            outputs.buffer.clear();
            if self.shared.stop_requested.get() {
                return CallbackStatus::Complete;
            }
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
            self.shared
                .position
                .fetch_add(frames as u64, Ordering::Relaxed);
            return CallbackStatus::Continue;
        }

        let empty: &[f32] = &[];
        let mut ins = [empty; MAX_CHANNELS];
        let in_channels = inputs.channels;
        for (slot, chunk) in ins
            .iter_mut()
            .zip(inputs.buffer[..frames * in_channels].chunks(frames))
        {
            *slot = chunk;
        }

        let mut outs: [&mut [f32]; MAX_CHANNELS] = core::array::from_fn(|_| Default::default());
        let out_channels = outputs.channels;
        for (slot, chunk) in outs
            .iter_mut()
            .zip(outputs.buffer[..frames * out_channels].chunks_mut(frames))
        {
            *slot = chunk;
        }

        self.render(&ins[..in_channels], &mut outs[..out_channels])
    }
}

/// Planar channel buffers backed by the driver's pool.
///
/// Channel `c` of a `frames`-long block occupies
/// `[c * frames, (c + 1) * frames)`.
pub struct ChannelScratch {
    buffer: PooledBuffer,
    channels: usize,
    max_frames: usize,
}

impl ChannelScratch {
    pub fn new(allocator: Arc<dyn RtAllocator>, channels: usize, max_frames: usize) -> Result<Self> {
        Ok(Self {
            buffer: PooledBuffer::new(allocator, channels * max_frames)?,
            channels: channels.min(MAX_CHANNELS),
            max_frames,
        })
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    #[inline]
    pub fn channel(&self, channel: usize, frames: usize) -> &[f32] {
        &self.buffer[channel * frames..(channel + 1) * frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, channel: usize, frames: usize) -> &mut [f32] {
        &mut self.buffer[channel * frames..(channel + 1) * frames]
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
