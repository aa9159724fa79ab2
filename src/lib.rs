//! Endura: the resource-lifecycle and frame-synchronization core of a small
//! Vulkan renderer.
//!
//! `backend` holds the core (device, swapchain, pipeline, buffers and the
//! frame loop). `window` and `assets` are the platform and disk
//! collaborators it is driven with; `config` reads `config.toml`.

pub mod assets;
pub mod backend;
pub mod config;
pub mod window;
