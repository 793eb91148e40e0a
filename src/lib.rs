//! promptreel: prompt-to-animation studio back-end.
//!
//! A prompt goes to a language model, comes back as a Manim scene, is
//! screened by the sandbox validator, rendered inside a container, and the
//! resulting videos are stored in a blob store with their metadata in SQLite.

pub mod config;
pub mod errors;
pub mod generator;
pub mod job;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod validator;
