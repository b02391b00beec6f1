//! playhost - playback controller for a set-top box media renderer.
//!
//! Control points drive a [`renderer::Controller`] from any thread. Every
//! hardware call is funnelled through a [`bridge::Bridge`] onto the one
//! privileged context allowed to touch the tuner, volume control and picture
//! viewer. Hosts provide that context ([`bridge::MainLoop`]) and implement the
//! [`hardware`] traits for their platform.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod hardware;
pub mod renderer;
