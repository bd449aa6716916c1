//! Gemini REST client (`generateContent`, `streamGenerateContent`, Files API).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::model::{
    Content, FileUpload, FunctionCall, FunctionDeclaration, GenerateRequest, GenerativeModel,
    ModelReply, Part, RemoteFile, ReplyStream, ToolMode,
};
use crate::TutorError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FILE_POLL_ATTEMPTS: u32 = 30;

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str, base_url: &str) -> Result<Self, TutorError> {
        if api_key.trim().is_empty() {
            return Err(TutorError::NotConfigured);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn model_url(&self, method: &str) -> String {
        format!("{}/v1beta/models/{}:{method}", self.base_url, self.model)
    }

    async fn post_generate(
        &self,
        method: &str,
        request: &GenerateRequest,
    ) -> Result<reqwest::Response, TutorError> {
        let resp = self
            .client
            .post(self.model_url(method))
            .header("x-goog-api-key", &self.api_key)
            .json(&to_wire(request))
            .send()
            .await?;
        check_status(resp).await
    }

    /// PDFs and other large files are processed asynchronously; they cannot
    /// be referenced until the state becomes `ACTIVE`.
    async fn wait_until_active(&self, mut file: WireFile) -> Result<WireFile, TutorError> {
        for _ in 0..FILE_POLL_ATTEMPTS {
            match file.state.as_deref() {
                None | Some("ACTIVE") | Some("STATE_UNSPECIFIED") => return Ok(file),
                Some("FAILED") => {
                    return Err(TutorError::InvalidResponse(format!(
                        "file {} failed provider processing",
                        file.name
                    )));
                }
                _ => {}
            }
            tokio::time::sleep(FILE_POLL_INTERVAL).await;
            let resp = self
                .client
                .get(format!("{}/v1beta/{}", self.base_url, file.name))
                .header("x-goog-api-key", &self.api_key)
                .send()
                .await?;
            file = check_status(resp).await?.json().await?;
        }
        Err(TutorError::InvalidResponse(format!(
            "file {} is still processing",
            file.name
        )))
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ModelReply, TutorError> {
        let resp = self.post_generate("generateContent", request).await?;
        let body: WireResponse = resp.json().await?;
        reply_from_wire(body)
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ReplyStream, TutorError> {
        let resp = self
            .post_generate("streamGenerateContent?alt=sse", request)
            .await?;
        let state = SseState {
            bytes: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.extend_from_slice(&chunk);
                        let chunks = drain_sse_data(&mut state.buffer);
                        state
                            .pending
                            .extend(chunks.iter().filter_map(|data| parse_stream_chunk(data)));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        state.pending.push_back(Err(e.into()));
                    }
                    None => {
                        state.done = true;
                        state.buffer.push(b'\n');
                        let chunks = drain_sse_data(&mut state.buffer);
                        state
                            .pending
                            .extend(chunks.iter().filter_map(|data| parse_stream_chunk(data)));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<RemoteFile, TutorError> {
        let metadata = serde_json::json!({ "file": { "display_name": upload.display_name } });
        let form = reqwest::multipart::Form::new()
            .part(
                "metadata",
                reqwest::multipart::Part::text(metadata.to_string())
                    .mime_str("application/json")?,
            )
            .part(
                "file",
                reqwest::multipart::Part::bytes(upload.bytes)
                    .file_name(upload.display_name.clone())
                    .mime_str(&upload.mime_type)?,
            );

        let resp = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "multipart")
            .multipart(form)
            .send()
            .await?;
        let uploaded: WireUploadResponse = check_status(resp).await?.json().await?;
        let file = self.wait_until_active(uploaded.file).await?;
        tracing::debug!(name = %file.name, "uploaded file to provider");
        Ok(remote_file_from_wire(file, &upload.mime_type))
    }
}

struct SseState {
    bytes: futures::stream::BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<ModelReply, TutorError>>,
    done: bool,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TutorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TutorError::Vendor {
        status: status.as_u16(),
        message: vendor_error_message(&body),
    })
}

/// Pull `error.message` out of a Google error body, falling back to the raw text.
fn vendor_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Remove every complete line from `buffer` and return the payloads of the
/// `data:` lines among them. A trailing partial line stays buffered.
fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim_start();
            if !data.is_empty() {
                out.push(data.to_string());
            }
        }
    }
    out
}

/// `None` for chunks with no candidates and no block reason, such as the
/// trailing usage-only chunk.
fn parse_stream_chunk(data: &str) -> Option<Result<ModelReply, TutorError>> {
    let body: WireResponse = match serde_json::from_str(data) {
        Ok(body) => body,
        Err(e) => {
            return Some(Err(TutorError::InvalidResponse(format!(
                "bad stream chunk: {e}"
            ))));
        }
    };
    let blocked = body
        .prompt_feedback
        .as_ref()
        .is_some_and(|f| f.block_reason.is_some());
    if body.candidates.is_empty() && !blocked {
        return None;
    }
    Some(reply_from_wire(body))
}

// ── Wire format ────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<WireToolConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolConfig {
    function_calling_config: WireFunctionCallingConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFunctionCallingConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    allowed_function_names: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<WireFileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    prompt_feedback: Option<WirePromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: WireContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUploadResponse {
    file: WireFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    expiration_time: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

fn to_wire(request: &GenerateRequest) -> WireRequest<'_> {
    let system_instruction = (!request.system_instruction.is_empty()).then(|| WireContent {
        role: None,
        parts: vec![WirePart {
            text: Some(request.system_instruction.clone()),
            ..Default::default()
        }],
    });

    let (tools, tool_config) = if request.tools.is_empty() {
        (Vec::new(), None)
    } else {
        let config = match &request.tool_mode {
            ToolMode::Auto => WireFunctionCallingConfig {
                mode: "AUTO",
                allowed_function_names: Vec::new(),
            },
            ToolMode::Required(names) => WireFunctionCallingConfig {
                mode: "ANY",
                allowed_function_names: names.clone(),
            },
            ToolMode::Disabled => WireFunctionCallingConfig {
                mode: "NONE",
                allowed_function_names: Vec::new(),
            },
        };
        (
            vec![WireTool {
                function_declarations: &request.tools,
            }],
            Some(WireToolConfig {
                function_calling_config: config,
            }),
        )
    };

    WireRequest {
        system_instruction,
        contents: request.contents.iter().map(content_to_wire).collect(),
        tools,
        tool_config,
    }
}

fn content_to_wire(content: &Content) -> WireContent {
    let parts = content
        .parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => WirePart {
                text: Some(text.clone()),
                ..Default::default()
            },
            Part::File { mime_type, uri } => WirePart {
                file_data: Some(WireFileData {
                    mime_type: mime_type.clone(),
                    file_uri: uri.clone(),
                }),
                ..Default::default()
            },
            Part::FunctionCall(call) => WirePart {
                function_call: Some(WireFunctionCall {
                    name: call.name.clone(),
                    args: call.args.clone(),
                }),
                ..Default::default()
            },
        })
        .collect();
    WireContent {
        role: Some(content.role.as_str().to_string()),
        parts,
    }
}

fn reply_from_wire(body: WireResponse) -> Result<ModelReply, TutorError> {
    let Some(candidate) = body.candidates.into_iter().next() else {
        let reason = body
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates".to_string());
        return Err(TutorError::InvalidResponse(format!("response blocked: {reason}")));
    };

    if candidate.content.parts.is_empty()
        && matches!(candidate.finish_reason.as_deref(), Some("SAFETY" | "RECITATION"))
    {
        return Err(TutorError::InvalidResponse(format!(
            "response blocked: {}",
            candidate.finish_reason.unwrap_or_default()
        )));
    }

    let mut reply = ModelReply::default();
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            reply.text.push_str(&text);
        }
        if let Some(call) = part.function_call {
            reply.function_calls.push(FunctionCall {
                name: call.name,
                args: call.args,
            });
        }
    }
    Ok(reply)
}

fn remote_file_from_wire(file: WireFile, fallback_mime: &str) -> RemoteFile {
    let expires_at = file
        .expiration_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    RemoteFile {
        name: file.name,
        uri: file.uri,
        mime_type: file.mime_type.unwrap_or_else(|| fallback_mime.to_string()),
        expires_at,
    }
}
