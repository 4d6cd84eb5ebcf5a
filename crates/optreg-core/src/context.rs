//! Explicit execution context threaded through every component.

use burn::tensor::backend::Backend;

/// Device handle passed to every operation that allocates tensors.
///
/// Components never reach for a default device on their own; whoever builds
/// the pipeline decides where computation happens and hands this down.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Block until queued work on the device has finished.
    ///
    /// Called at epoch boundaries so that freed buffers are returned to the
    /// allocator before the next epoch starts.
    pub fn sync(&self) {
        B::sync(&self.device);
    }
}

impl<B: Backend> Default for ExecutionContext<B> {
    fn default() -> Self {
        Self::new(B::Device::default())
    }
}
