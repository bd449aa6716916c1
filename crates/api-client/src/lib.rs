pub mod client;
pub mod retry;
pub mod upload_queue;

pub use client::{ApiClient, ProgressFn};
pub use retry::RetryConfig;
pub use studyhall_api;
pub use upload_queue::{JobState, MaterialUploader, RunSummary, UploadJob, UploadQueue};
