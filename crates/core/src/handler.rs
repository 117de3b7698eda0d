//! One event in, one response out.
//!
//! ```text
//! RECEIVED -> VALIDATED -> HEALTHY                                        -> DONE
//!                       -> GENERATING -> PERSISTING -> ENCODING -> ASSEMBLING -> DONE
//! ```
//!
//! Validation failures become an `{error}` [`Response`]. Everything after
//! validation fails with a [`HandlerError`] for the host to report; the
//! per-request workspace is gone either way.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, EncoderSettings, GenerationConfig};
use crate::encoder::encode;
use crate::error::HandlerError;
use crate::model::{ModelHandleManager, ModelLoader};
use crate::synthesis::{generate, image_conditioning, Conditioning};
use crate::workspace::Workspace;

const ENVELOPE_KEY: &str = "input";
const HEALTHCHECK_KEY: &str = "healthcheck";
const PROMPT_KEY: &str = "prompt";
const IMAGE_KEY: &str = "image_base64";

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Healthcheck,
    Prompt(String),
    /// Decoded bytes of `image_base64`, not yet interpreted as an image.
    Image(Vec<u8>),
}

impl Request {
    /// Validate a raw event. Every `Err` is [`HandlerError::Validation`].
    ///
    /// `null`, `{}` and `{"input": {}}` are healthchecks, as is any event with
    /// `"healthcheck": true` either at the top level or inside the envelope.
    pub fn parse(event: &Value) -> Result<Self, HandlerError> {
        let fields = match event {
            Value::Null => return Ok(Self::Healthcheck),
            Value::Object(fields) => {
                if healthcheck_requested(fields)? {
                    return Ok(Self::Healthcheck);
                }
                unwrap_envelope(fields)?
            }
            other => {
                return Err(HandlerError::validation(format!(
                    "event must be a JSON object, got {}",
                    json_type_name(other)
                )))
            }
        };
        let Some(fields) = fields else {
            return Ok(Self::Healthcheck);
        };
        if fields.is_empty() {
            return Ok(Self::Healthcheck);
        }

        if healthcheck_requested(fields)? {
            return Ok(Self::Healthcheck);
        }

        let prompt = optional_string(fields, PROMPT_KEY)?;
        let image = optional_string(fields, IMAGE_KEY)?;

        match (prompt, image) {
            (Some(_), Some(_)) => Err(HandlerError::validation(format!(
                "provide exactly one of {PROMPT_KEY} or {IMAGE_KEY}, not both"
            ))),
            (Some(prompt), None) => {
                let prompt = prompt.trim();
                if prompt.is_empty() {
                    return Err(HandlerError::validation(format!("{PROMPT_KEY} is empty")));
                }
                Ok(Self::Prompt(prompt.to_string()))
            }
            (None, Some(encoded)) => decode_base64_payload(encoded).map(Self::Image),
            (None, None) => Err(HandlerError::validation(format!(
                "missing input: provide {PROMPT_KEY} or {IMAGE_KEY}"
            ))),
        }
    }
}

fn healthcheck_requested(fields: &Map<String, Value>) -> Result<bool, HandlerError> {
    match fields.get(HEALTHCHECK_KEY) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(HandlerError::validation(format!(
            "{HEALTHCHECK_KEY} must be a boolean, got {}",
            json_type_name(other)
        ))),
    }
}

/// `Ok(None)` for an absent or `null` envelope body.
fn unwrap_envelope(fields: &Map<String, Value>) -> Result<Option<&Map<String, Value>>, HandlerError> {
    match fields.get(ENVELOPE_KEY) {
        None => Ok(Some(fields)),
        Some(Value::Object(inner)) => Ok(Some(inner)),
        Some(Value::Null) => Ok(None),
        Some(other) => Err(HandlerError::validation(format!(
            "{ENVELOPE_KEY} must be a JSON object, got {}",
            json_type_name(other)
        ))),
    }
}

fn optional_string<'a>(
    fields: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, HandlerError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(HandlerError::validation(format!(
            "{key} must be a string, got {}",
            json_type_name(other)
        ))),
    }
}

/// Accepts plain base64 or a `data:<mime>;base64,` URL.
fn decode_base64_payload(encoded: &str) -> Result<Vec<u8>, HandlerError> {
    let trimmed = encoded.trim();
    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| {
                HandlerError::validation(format!("{IMAGE_KEY} data URL is not base64-encoded"))
            })?,
        None => trimmed,
    };
    if payload.is_empty() {
        return Err(HandlerError::validation(format!("{IMAGE_KEY} is empty")));
    }
    STANDARD
        .decode(payload)
        .map_err(|e| HandlerError::validation(format!("{IMAGE_KEY} is not valid base64: {e}")))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Validated,
    Healthy,
    Generating,
    Persisting,
    Encoding,
    Assembling,
    Done,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Healthy => "healthy",
            Self::Generating => "generating",
            Self::Persisting => "persisting",
            Self::Encoding => "encoding",
            Self::Assembling => "assembling",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoResponse {
    pub ok: bool,
    pub duration_s: u32,
    pub fps: u32,
    /// `"<width>x<height>"`.
    pub resolution: String,
    pub video_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Video(VideoResponse),
    Healthy { ok: bool },
    Error { error: String },
}

impl Response {
    pub fn healthy() -> Self {
        Self::Healthy { ok: true }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Owns everything a worker process keeps between requests: the immutable
/// generation settings and the lazily loaded model.
pub struct Handler<L: ModelLoader> {
    config: GenerationConfig,
    encoder: EncoderSettings,
    workspace_root: Option<PathBuf>,
    models: ModelHandleManager<L>,
}

impl<L: ModelLoader> Handler<L> {
    pub fn new(
        config: GenerationConfig,
        encoder: EncoderSettings,
        workspace_root: Option<PathBuf>,
        loader: L,
    ) -> Self {
        Self {
            config,
            encoder,
            workspace_root,
            models: ModelHandleManager::new(loader),
        }
    }

    pub fn from_app_config(app: &AppConfig, loader: L) -> Result<Self> {
        Ok(Self::new(
            app.generation_config()?,
            app.encoder.clone(),
            app.workspace.root.clone(),
            loader,
        ))
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelHandleManager<L> {
        &self.models
    }

    pub fn handle(&self, event: &Value) -> Result<Response, HandlerError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("request", id = %request_id.simple());
        let _entered = span.enter();

        let result = self.dispatch(event, request_id);
        if let Err(error) = &result {
            error!(kind = error.kind(), error = %error, "Request failed");
        }
        result
    }

    fn dispatch(&self, event: &Value, request_id: Uuid) -> Result<Response, HandlerError> {
        enter(RequestStage::Received);

        let request = match Request::parse(event) {
            Ok(request) => request,
            Err(HandlerError::Validation(message)) => {
                warn!(error = %message, "Rejected request");
                return Ok(Response::error(message));
            }
            Err(other) => return Err(other),
        };
        enter(RequestStage::Validated);

        let conditioning = match request {
            Request::Healthcheck => {
                enter(RequestStage::Healthy);
                enter(RequestStage::Done);
                return Ok(Response::healthy());
            }
            Request::Prompt(prompt) => Conditioning::Text(prompt),
            Request::Image(bytes) => match image_conditioning(&bytes, &self.config) {
                Ok(conditioning) => conditioning,
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(error = %message, "Rejected request");
                    return Ok(Response::error(message));
                }
            },
        };

        let model = self.models.get_handle()?;

        enter(RequestStage::Generating);
        let frames = generate(model, &conditioning, &self.config)?;

        enter(RequestStage::Persisting);
        let mut workspace = Workspace::create(self.workspace_root.as_deref(), request_id)?;
        workspace.persist(&frames)?;
        drop(frames);

        enter(RequestStage::Encoding);
        let video = encode(
            &self.encoder,
            &workspace.frames_dir(),
            &workspace.output_path(),
            &self.config,
        )?;

        // The bytes are already in memory; a stuck directory is not worth
        // failing the request over.
        if let Err(error) = workspace.teardown() {
            warn!(error = %error, "Workspace cleanup failed");
        }

        enter(RequestStage::Assembling);
        let response = Response::Video(VideoResponse {
            ok: true,
            duration_s: self.config.duration_s(),
            fps: self.config.fps(),
            resolution: self.config.resolution(),
            video_base64: STANDARD.encode(&video),
        });

        enter(RequestStage::Done);
        Ok(response)
    }
}

fn enter(stage: RequestStage) {
    debug!(stage = %stage, "Request stage");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use image::RgbImage;
    use serde_json::json;

    use super::*;
    use crate::model::{FrameRequest, VideoModel};

    struct NeverModel;

    impl VideoModel for NeverModel {
        fn synthesize(&self, _: &Conditioning, _: &FrameRequest) -> Result<Vec<RgbImage>> {
            anyhow::bail!("must not be called")
        }
    }

    #[derive(Clone, Default)]
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    impl ModelLoader for CountingLoader {
        type Model = NeverModel;

        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn load(&self) -> Result<NeverModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(NeverModel)
        }
    }

    fn handler(root: &std::path::Path, loader: CountingLoader) -> Handler<CountingLoader> {
        Handler::new(
            GenerationConfig::new(2, 1, 8, 8).expect("valid config"),
            EncoderSettings {
                program: "reelgen-encoder-that-does-not-exist".to_string(),
                codec: "libx264".to_string(),
            },
            Some(root.to_path_buf()),
            loader,
        )
    }

    fn validation_message(event: Value) -> String {
        match Request::parse(&event) {
            Err(HandlerError::Validation(message)) => message,
            other => panic!("expected validation error for {event}, got {other:?}"),
        }
    }

    #[test]
    fn healthcheck_shapes() {
        for event in [
            Value::Null,
            json!({}),
            json!({"healthcheck": true}),
            json!({"input": {}}),
            json!({"input": null}),
            json!({"input": {"healthcheck": true, "prompt": "ignored"}}),
        ] {
            assert_eq!(
                Request::parse(&event).expect("parses"),
                Request::Healthcheck,
                "{event}"
            );
        }
    }

    #[test]
    fn prompt_is_trimmed_and_envelope_unwrapped() {
        assert_eq!(
            Request::parse(&json!({"prompt": "  cinematic scene "})).expect("parses"),
            Request::Prompt("cinematic scene".to_string())
        );
        assert_eq!(
            Request::parse(&json!({"input": {"prompt": "waves"}})).expect("parses"),
            Request::Prompt("waves".to_string())
        );
    }

    #[test]
    fn image_payload_accepts_plain_and_data_url_base64() {
        let encoded = STANDARD.encode(b"\x89PNG fake");
        assert_eq!(
            Request::parse(&json!({"image_base64": encoded})).expect("plain"),
            Request::Image(b"\x89PNG fake".to_vec())
        );
        assert_eq!(
            Request::parse(&json!({"image_base64": format!("data:image/png;base64,{encoded}")}))
                .expect("data url"),
            Request::Image(b"\x89PNG fake".to_vec())
        );
    }

    #[test]
    fn malformed_events_are_validation_errors() {
        assert!(validation_message(json!({"healthcheck": false})).contains("missing input"));
        assert!(validation_message(json!({"other": 1})).contains("missing input"));
        assert!(validation_message(json!({"prompt": "   "})).contains("prompt is empty"));
        assert!(validation_message(json!({"prompt": 42})).contains("prompt must be a string"));
        assert!(validation_message(json!({"prompt": "a", "image_base64": "AAAA"}))
            .contains("exactly one"));
        assert!(validation_message(json!({"image_base64": "%%%"})).contains("not valid base64"));
        assert!(validation_message(json!({"image_base64": "data:image/png,abc"}))
            .contains("not base64-encoded"));
        assert!(validation_message(json!({"healthcheck": "yes"})).contains("must be a boolean"));
        assert!(validation_message(json!({"input": []})).contains("input must be a JSON object"));
        assert!(validation_message(json!("prompt")).contains("event must be a JSON object"));
    }

    #[test]
    fn healthcheck_never_touches_the_model() {
        let root = tempfile::tempdir().expect("root");
        let loader = CountingLoader::default();
        let handler = handler(root.path(), loader.clone());

        let response = handler.handle(&json!({})).expect("healthcheck");
        assert_eq!(response, Response::healthy());
        assert_eq!(
            serde_json::to_value(&response).expect("serialize"),
            json!({"ok": true})
        );
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert!(!handler.models().is_loaded());
    }

    #[test]
    fn top_level_healthcheck_flag_wins_over_enveloped_prompt() {
        let event = json!({"healthcheck": true, "input": {"prompt": "x"}});
        assert_eq!(Request::parse(&event).expect("parses"), Request::Healthcheck);
        assert!(validation_message(json!({"healthcheck": 1, "input": {"prompt": "x"}}))
            .contains("must be a boolean"));

        let root = tempfile::tempdir().expect("root");
        let loader = CountingLoader::default();
        let handler = handler(root.path(), loader.clone());
        assert_eq!(handler.handle(&event).expect("healthcheck"), Response::healthy());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);

        let enveloped_off = json!({"healthcheck": false, "input": {"prompt": "waves"}});
        assert_eq!(
            Request::parse(&enveloped_off).expect("parses"),
            Request::Prompt("waves".to_string())
        );
    }

    #[test]
    fn missing_input_answers_error_without_workspace_or_model() {
        let root = tempfile::tempdir().expect("root");
        let loader = CountingLoader::default();
        let handler = handler(root.path(), loader.clone());

        let response = handler.handle(&json!({"unrelated": true})).expect("handled");
        match &response {
            Response::Error { error } => assert!(!error.is_empty()),
            other => panic!("expected error response, got {other:?}"),
        }
        assert_eq!(
            serde_json::to_value(&response).expect("serialize")["error"],
            json!(validation_message(json!({"unrelated": true})))
        );
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(root.path()).expect("read root").count(), 0);
    }

    #[test]
    fn undecodable_image_answers_error() {
        let root = tempfile::tempdir().expect("root");
        let loader = CountingLoader::default();
        let handler = handler(root.path(), loader.clone());

        let event = json!({"image_base64": STANDARD.encode(b"not an image")});
        let response = handler.handle(&event).expect("handled");
        assert!(response.is_error());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn generation_failure_is_a_system_error_and_keeps_model_cached() {
        let root = tempfile::tempdir().expect("root");
        let loader = CountingLoader::default();
        let handler = handler(root.path(), loader.clone());

        for _ in 0..2 {
            let err = handler
                .handle(&json!({"prompt": "x"}))
                .expect_err("model always fails");
            assert_eq!(err.kind(), "generation");
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(root.path()).expect("read root").count(), 0);
    }

    #[test]
    fn response_shapes_serialize_as_documented() {
        let video = Response::Video(VideoResponse {
            ok: true,
            duration_s: 8,
            fps: 12,
            resolution: "576x1024".to_string(),
            video_base64: "AAAA".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&video).expect("serialize"),
            json!({
                "ok": true,
                "duration_s": 8,
                "fps": 12,
                "resolution": "576x1024",
                "video_base64": "AAAA"
            })
        );
        assert_eq!(
            serde_json::to_value(Response::error("boom")).expect("serialize"),
            json!({"error": "boom"})
        );
    }

    #[test]
    fn stage_names_are_lowercase() {
        assert_eq!(RequestStage::Generating.to_string(), "generating");
        assert_eq!(RequestStage::Done.to_string(), "done");
    }
}
