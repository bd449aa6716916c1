//! The AI side of studyhall.
//!
//! - [`model`]: provider-neutral request/response types and the
//!   [`GenerativeModel`] trait the server talks to.
//! - [`gemini`]: REST client for Google's Gemini API.
//! - [`tools`]: function declarations for quiz / flashcard generation and
//!   parsing of the model's tool calls into API types.
//! - [`prompt`]: system prompt and material context assembly.
//! - [`chat`] and [`session_cache`]: the per-lesson conversation handle and
//!   the bounded, expiring in-process cache that keeps it warm.

pub mod chat;
pub mod error;
pub mod gemini;
pub mod model;
pub mod prompt;
pub mod session_cache;
pub mod tools;

pub use chat::ChatSession;
pub use error::TutorError;
pub use gemini::GeminiClient;
pub use model::{
    Content, FileUpload, FunctionCall, FunctionDeclaration, GenerateRequest, GenerativeModel,
    ModelReply, Part, RemoteFile, ReplyStream, Role, ToolMode,
};
pub use session_cache::SessionCache;
