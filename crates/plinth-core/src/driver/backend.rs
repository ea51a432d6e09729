use super::callback::BlockRenderer;
use super::config::DriverConfig;
use crate::Result;

/// Platform audio I/O behind the driver.
///
/// The driver calls these from the control thread only. A backend owns at
/// most one stream at a time; the stream's callback owns the
/// [`BlockRenderer`] and calls it once per hardware block.
pub trait AudioBackend: Send {
    fn name(&self) -> &str;

    /// Adjust `config` to what the device actually supports.
    fn negotiate(&mut self, config: &DriverConfig) -> Result<DriverConfig>;

    /// Open and start a stream driven by `renderer`.
    fn open(&mut self, renderer: BlockRenderer) -> Result<()>;

    /// Stop and release the stream. Idempotent.
    fn close(&mut self);
}

impl<B: AudioBackend + ?Sized> AudioBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn negotiate(&mut self, config: &DriverConfig) -> Result<DriverConfig> {
        (**self).negotiate(config)
    }

    fn open(&mut self, renderer: BlockRenderer) -> Result<()> {
        (**self).open(renderer)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
