//! Prompt- or image-conditioned vertical video generation for serverless workers.

pub mod backend;
pub mod config;
pub mod encoder;
pub mod error;
pub mod handler;
pub mod logging;
pub mod model;
pub mod onnx_model;
pub mod runtime;
pub mod server;
pub mod synthesis;
pub mod workspace;
