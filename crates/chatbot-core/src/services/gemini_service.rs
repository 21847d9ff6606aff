use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::completion_service::{CompletionError, CompletionSource, ResponseStream, StreamChunk};
use crate::models::Turn;
use crate::repositories::BoxFuture;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl ApiError {
    fn describe(&self) -> String {
        match &self.status {
            Some(status) => format!("{status}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Incremental decoder for the `alt=sse` response body.
///
/// Network chunks can split a line (or a UTF-8 sequence) anywhere, so bytes
/// are buffered until a full line is available.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the chunks completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(chunk) = Self::decode_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<StreamChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Self::decode_line(&line)
    }

    fn decode_line(raw: &[u8]) -> Option<StreamChunk> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let payload = line.strip_prefix("data:")?.trim_start();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }

        let response: GenerateResponse = match serde_json::from_str(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = ?e, "Malformed Gemini stream payload");
                return Some(StreamChunk::Error(format!("malformed stream payload: {e}")));
            }
        };

        if let Some(error) = response.error {
            return Some(StreamChunk::Error(error.describe()));
        }

        let text: String = response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default();

        (!text.is_empty()).then_some(StreamChunk::Text(text))
    }
}

/// Gemini `streamGenerateContent` completion source.
#[derive(Clone)]
pub struct GeminiCompletionSource {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiCompletionSource {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl CompletionSource for GeminiCompletionSource {
    fn stream_completion(
        &self,
        history: Vec<Turn>,
    ) -> BoxFuture<'static, Result<ResponseStream, CompletionError>> {
        let client = self.client.clone();
        let config = self.config.clone();

        Box::pin(async move {
            if config.api_key.is_empty() {
                return Err(CompletionError::NotConfigured(
                    "GEMINI_API_KEY is not set".into(),
                ));
            }
            if history.is_empty() {
                return Err(CompletionError::EmptyHistory);
            }

            let request = GenerateRequest {
                contents: history
                    .iter()
                    .map(|turn| Content {
                        role: turn.role.as_str(),
                        parts: [Part { text: &turn.text }],
                    })
                    .collect(),
            };

            debug!(model = %config.model, turns = history.len(), "Opening Gemini stream");

            let response = client
                .post(config.stream_url())
                .query(&[("alt", "sse")])
                .header("x-goog-api-key", &config.api_key)
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<GenerateResponse>(&body)
                    .ok()
                    .and_then(|r| r.error)
                    .map(|e| e.describe())
                    .unwrap_or(body);
                return Err(CompletionError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            let mut bytes = response.bytes_stream();
            let stream: ResponseStream = Box::pin(async_stream::stream! {
                let mut decoder = SseDecoder::default();
                while let Some(item) = bytes.next().await {
                    match item {
                        Ok(chunk) => {
                            for decoded in decoder.push(&chunk) {
                                let failed = matches!(decoded, StreamChunk::Error(_));
                                yield decoded;
                                if failed {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            yield StreamChunk::Error(e.to_string());
                            return;
                        }
                    }
                }
                if let Some(decoded) = decoder.finish() {
                    let failed = matches!(decoded, StreamChunk::Error(_));
                    yield decoded;
                    if failed {
                        return;
                    }
                }
                yield StreamChunk::Done;
            });

            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame(text: &str) -> String {
        let payload = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
        });
        format!("data: {payload}\r\n\r\n")
    }

    #[test]
    fn test_decoder_handles_lines_split_across_chunks() {
        let body = format!("{}{}", frame("Hi"), frame(" there"));
        let (a, b) = body.as_bytes().split_at(17);

        let mut decoder = SseDecoder::default();
        let mut chunks = decoder.push(a);
        assert!(chunks.is_empty());
        chunks.extend(decoder.push(b));

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("Hi".into()),
                StreamChunk::Text(" there".into())
            ]
        );
    }

    #[test]
    fn test_decoder_joins_parts_and_skips_empty_text() {
        let mut decoder = SseDecoder::default();
        let line = concat!(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#,
            "\n"
        );
        assert_eq!(decoder.push(line.as_bytes()), vec![StreamChunk::Text("ab".into())]);

        let empty = concat!(
            r#"data: {"candidates":[{"content":{"parts":[{"text":""}]},"finishReason":"STOP"}]}"#,
            "\n"
        );
        assert!(decoder.push(empty.as_bytes()).is_empty());
    }

    #[test]
    fn test_decoder_reports_error_payload() {
        let mut decoder = SseDecoder::default();
        let line =
            r#"data: {"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(decoder.push(line.as_bytes()).is_empty());
        assert_eq!(
            decoder.finish(),
            Some(StreamChunk::Error("RESOURCE_EXHAUSTED: quota".into()))
        );
    }

    #[test]
    fn test_decoder_keeps_multibyte_text_intact() {
        let body = frame("héllo ✓");
        let bytes = body.as_bytes();
        let split = body.find('é').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        let mut chunks = decoder.push(&bytes[..split]);
        chunks.extend(decoder.push(&bytes[split..]));
        assert_eq!(chunks, vec![StreamChunk::Text("héllo ✓".into())]);
    }

    #[tokio::test]
    async fn test_stream_completion_against_mock_server() {
        let server = MockServer::start().await;
        let body = format!("{}{}", frame("Hi"), frame(" there!"));

        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "contents": [{"role": "user", "parts": [{"text": "Hello"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut config = GeminiConfig::new("test-key");
        config.base_url = server.uri();
        let source = GeminiCompletionSource::new(config);

        let history = vec![Turn {
            role: Sender::User,
            text: "Hello".into(),
        }];
        let chunks: Vec<StreamChunk> = source
            .stream_completion(history)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("Hi".into()),
                StreamChunk::Text(" there!".into()),
                StreamChunk::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_http_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT"}
            })))
            .mount(&server)
            .await;

        let mut config = GeminiConfig::new("bad");
        config.base_url = server.uri();
        let source = GeminiCompletionSource::new(config);

        let result = source
            .stream_completion(vec![Turn {
                role: Sender::User,
                text: "Hello".into(),
            }])
            .await;

        match result {
            Err(CompletionError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "INVALID_ARGUMENT: API key not valid");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let source = GeminiCompletionSource::new(GeminiConfig::new(""));
        let result = source
            .stream_completion(vec![Turn {
                role: Sender::User,
                text: "Hello".into(),
            }])
            .await;
        assert!(matches!(result, Err(CompletionError::NotConfigured(_))));
    }
}
