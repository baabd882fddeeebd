//! Background layout and tile rendering engine for a paginated document viewer.
//!
//! The [`engine`] module holds the worker side: a command loop fed by a
//! controller over a framed text channel, the document session and layout,
//! and tile rasterization. The [`gpu`] module holds the render side: the
//! texture slot cache, optional staging buffers and the tile compositor.

pub mod engine;
pub mod gpu;
pub mod panic_handler;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use engine::{Engine, ImageDocDecoder};
pub use gpu::{GpuBackend, RenderContext, SoftwareGpu};
pub use settings::EngineConfig;
