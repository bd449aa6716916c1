//! Provider-neutral generation types.
//!
//! The server builds [`GenerateRequest`]s and talks to a `dyn GenerativeModel`;
//! only [`crate::gemini`] knows the vendor wire format. Tests substitute a
//! scripted model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::TutorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// A previously uploaded file, referenced by its vendor URI.
    File { mime_type: String, uri: String },
    FunctionCall(FunctionCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text(text.into())],
        }
    }
}

/// A callable tool offered to the model. `parameters` is an OpenAPI-style
/// schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolMode {
    /// The model decides whether to call a tool.
    #[default]
    Auto,
    /// The model must call one of the named tools (all tools when empty).
    Required(Vec<String>),
    Disabled,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system_instruction: String,
    pub contents: Vec<Content>,
    pub tools: Vec<FunctionDeclaration>,
    pub tool_mode: ToolMode,
}

/// Model output: concatenated text plus any tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            function_calls: Vec::new(),
        }
    }

    /// Append a streamed chunk.
    pub fn merge(&mut self, chunk: ModelReply) {
        self.text.push_str(&chunk.text);
        self.function_calls.extend(chunk.function_calls);
    }

    pub fn find_call(&self, name: &str) -> Option<&FunctionCall> {
        self.function_calls.iter().find(|c| c.name == name)
    }
}

/// Bytes handed to the provider's file store.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub display_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A file living in the provider's store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    /// Provider resource name (e.g. `files/abc123`).
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RemoteFile {
    pub fn as_part(&self) -> Part {
        Part::File {
            mime_type: self.mime_type.clone(),
            uri: self.uri.clone(),
        }
    }
}

pub type ReplyStream = BoxStream<'static, Result<ModelReply, TutorError>>;

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<ModelReply, TutorError>;

    /// Incremental generation. Providers without streaming yield the whole
    /// reply as a single chunk.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ReplyStream, TutorError> {
        let reply = self.generate(request).await?;
        Ok(futures::stream::once(async move { Ok(reply) }).boxed())
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<RemoteFile, TutorError>;
}
