use anyhow::Error;
use http::{Method, Request, Response, header, request::Parts};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use crate::{
    api::{
        ChatCompletionChunk, ChatCompletionRequest, EmbeddingsRequest, StreamChoice, StreamDelta,
    },
    catalog,
    error::ApiError,
    service::{Outgoing, Service, empty_body, json_response},
    stream::{self, FrameSink, Pacing, SinkClosed, StreamFrame},
    synth::Synthesizer,
};

#[derive(Clone, Copy, Debug)]
pub struct ApiConfig {
    /// Log request details (path, X-* headers, masked authorization).
    pub verbose: bool,
    pub pacing: Pacing,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            pacing: Pacing::default(),
        }
    }
}

/// The HTTP-facing inference endpoint: validates requests, invokes the
/// synthesizer, and answers with one JSON object or an SSE stream.
pub struct Api {
    synth: Synthesizer,
    config: ApiConfig,
}

impl Api {
    pub fn new(synth: Synthesizer, config: ApiConfig) -> Self {
        Self { synth, config }
    }

    async fn dispatch(&self, parts: &Parts, body: &Bytes) -> Result<Response<Outgoing>, ApiError> {
        if parts.method == Method::OPTIONS {
            return Ok(Response::builder().status(200).body(empty_body())?);
        }
        match parts.uri.path() {
            "/v1/models" => self.list_models(parts),
            path if path.starts_with("/v1/models/") => self.get_model(parts),
            "/v1/chat/completions" => self.chat_completions(parts, body),
            "/v1/embeddings" => self.embeddings(parts, body),
            path => Err(ApiError::not_found(
                format!("Unknown request URL: {path}"),
                "unknown_url",
            )),
        }
    }

    fn list_models(&self, parts: &Parts) -> Result<Response<Outgoing>, ApiError> {
        if parts.method != Method::GET {
            return Err(ApiError::method_not_allowed());
        }
        json_response(&catalog::all())
    }

    fn get_model(&self, parts: &Parts) -> Result<Response<Outgoing>, ApiError> {
        if parts.method != Method::GET {
            return Err(ApiError::method_not_allowed());
        }
        let id = parts
            .uri
            .path()
            .strip_prefix("/v1/models/")
            .unwrap_or_default()
            .trim_end_matches('/');
        match catalog::find(id) {
            Some(model) => json_response(model),
            None => Err(ApiError::not_found(
                format!("The model '{id}' does not exist"),
                "model_not_found",
            )),
        }
    }

    fn chat_completions(&self, parts: &Parts, body: &Bytes) -> Result<Response<Outgoing>, ApiError> {
        if parts.method != Method::POST {
            return Err(ApiError::method_not_allowed());
        }
        let req: ChatCompletionRequest =
            serde_json::from_slice(body).map_err(ApiError::bad_body)?;
        if req.model.is_empty() {
            return Err(ApiError::missing_param("model"));
        }
        if req.messages.is_empty() {
            return Err(ApiError::missing_param("messages"));
        }
        if req.stream {
            self.stream_chat(&req)
        } else {
            json_response(&self.synth.synthesize(&req))
        }
    }

    fn stream_chat(&self, req: &ChatCompletionRequest) -> Result<Response<Outgoing>, ApiError> {
        let response = self.synth.synthesize(req);
        let message = response.choices[0].message.clone();
        let finish_reason = response.choices[0].finish_reason.clone();
        let pacing = self.config.pacing;

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let mut sink = SseSink {
            tx,
            head: ChunkHead {
                id: response.id,
                created: response.created,
                model: response.model,
                fingerprint: response.system_fingerprint,
            },
        };
        tokio::task::spawn(async move {
            if stream::encode(&message, &finish_reason, pacing, &mut sink)
                .await
                .is_err()
            {
                log::debug!("Stream consumer disconnected, encoding aborted");
            }
        });

        // One SSE event per body frame; hyper flushes each frame as it is
        // produced, so pacing boundaries stay visible to the client.
        let events = ReceiverStream::new(rx).map(|data| Ok::<_, Error>(Frame::data(data)));
        Ok(Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(StreamBody::new(events).boxed())?)
    }

    fn embeddings(&self, parts: &Parts, body: &Bytes) -> Result<Response<Outgoing>, ApiError> {
        if parts.method != Method::POST {
            return Err(ApiError::method_not_allowed());
        }
        let req: EmbeddingsRequest = serde_json::from_slice(body).map_err(ApiError::bad_body)?;
        if req.model.is_empty() {
            return Err(ApiError::missing_param("model"));
        }
        let Some(input) = &req.input else {
            return Err(ApiError::missing_param("input"));
        };
        json_response(&self.synth.embed(&req, input))
    }

    fn log_request(&self, parts: &Parts) {
        log::info!("[{}] {}", parts.method, parts.uri.path());
        for (name, value) in &parts.headers {
            if name.as_str().starts_with("x-") {
                log::info!("  Header: {}: {}", name, String::from_utf8_lossy(value.as_bytes()));
            }
        }
        if let Some(auth) = parts.headers.get(header::AUTHORIZATION) {
            let auth = String::from_utf8_lossy(auth.as_bytes());
            log::info!("  Header: Authorization: {}", mask_secret(&auth));
        }
    }
}

/// Keeps the first 10 and last 4 characters of a long secret. Counts
/// characters, not bytes: lossy-decoded header values may hold multi-byte
/// chars at arbitrary positions.
fn mask_secret(value: &str) -> String {
    let len = value.chars().count();
    if len <= 20 {
        return value.to_string();
    }
    let head: String = value.chars().take(10).collect();
    let tail: String = value.chars().skip(len - 4).collect();
    format!("{head}...{tail}")
}

impl Service for Api {
    async fn call(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, Error> {
        let (parts, body) = req.into_parts();
        if self.config.verbose {
            self.log_request(&parts);
        }
        let data = body.collect().await?.to_bytes();
        let mut res = match self.dispatch(&parts, &data).await {
            Ok(res) => res,
            Err(err) => err.into_response()?,
        };
        apply_cors(res.headers_mut());
        Ok(res)
    }
}

fn apply_cors(headers: &mut http::HeaderMap) {
    use http::HeaderValue;
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS, DELETE, PUT, PATCH"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Request-ID"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
}

/// Serializes frames into `data:` events and pushes them to the response
/// body channel. A dropped receiver (client gone) surfaces as `SinkClosed`.
struct SseSink {
    tx: mpsc::Sender<Bytes>,
    head: ChunkHead,
}

struct ChunkHead {
    id: String,
    created: i64,
    model: String,
    fingerprint: String,
}

impl ChunkHead {
    fn event(&self, delta: StreamDelta, finish_reason: Option<String>) -> Result<Bytes, SinkClosed> {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            system_fingerprint: self.fingerprint.clone(),
            choices: smallvec::smallvec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };
        let mut buf = Vec::from(&b"data: "[..]);
        serde_json::to_writer(&mut buf, &chunk).map_err(|_| SinkClosed)?;
        buf.extend_from_slice(b"\n\n");
        Ok(Bytes::from(buf))
    }
}

impl FrameSink for SseSink {
    async fn emit(&mut self, frame: StreamFrame) -> Result<(), SinkClosed> {
        let event = match frame {
            StreamFrame::Done => Bytes::from_static(b"data: [DONE]\n\n"),
            StreamFrame::RoleOpen => self.head.event(
                StreamDelta {
                    role: Some("assistant".to_string()),
                    ..Default::default()
                },
                None,
            )?,
            StreamFrame::ContentDelta(content) => self.head.event(
                StreamDelta {
                    content: Some(content),
                    ..Default::default()
                },
                None,
            )?,
            StreamFrame::ToolDelta(call) => self.head.event(
                StreamDelta {
                    tool_calls: Some(vec![call]),
                    ..Default::default()
                },
                None,
            )?,
            StreamFrame::Finish(reason) => self.head.event(StreamDelta::default(), Some(reason))?,
        };
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}
