//! GPU presentation.
//!
//! The capture, warp and composite passes produce a CPU frame; the presenter
//! uploads it, scales it to the viewer size on the GPU and reads the result
//! back, standing in for a platform swapchain.

pub mod presenter;

pub use presenter::GpuPresenter;
