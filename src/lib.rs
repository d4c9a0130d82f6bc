//! Image captioning over HTTP.
//!
//! The BLIP model is loaded once and moved to an [`InferenceEngine`], which runs
//! it on a dedicated thread. The [`server`] module exposes the engine as a
//! `POST /describe` endpoint that takes a multipart image upload and answers
//! with `{"description": "..."}`.

pub mod blip;
pub mod engine;
pub mod messages;
pub mod model;
pub mod preprocess;
pub mod server;

pub use blip::{Blip, BlipConfig, BlipError, BlipVariant};
pub use engine::{EngineError, EngineResponse, EngineState, InferenceEngine};
pub use model::{
    CaptionMetadata, CaptionModel, CaptionRequest, CaptionResponse, InferenceModel,
    RequestMetadata,
};
pub use server::{ServerConfig, router, serve};
