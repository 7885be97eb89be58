#![forbid(unsafe_code)]

//! Public entry point for the ASHN media crate.
//!
//! The crate holds the upload ingestion pipeline: extension checks, safe
//! on-disk naming, the ffmpeg HLS driver, playback URL resolution and the
//! SQLite video store. The binaries under `src/bin` wire these together.

pub mod config;
pub mod encoder;
pub mod metadata;
pub mod pipeline;
pub mod playback;
pub mod security;
pub mod upload;
