//! Sequential material upload queue with per-job progress.
//!
//! Jobs move Queued → Uploading → Done | Failed. Cancelled jobs are skipped
//! by [`UploadQueue::run`]; failed or cancelled jobs can be re-queued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use studyhall_api::Material;

use crate::client::{ApiClient, ProgressFn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Uploading,
    Done,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: u64,
    pub course_id: String,
    pub path: PathBuf,
    pub tags: Vec<String>,
    pub state: JobState,
    /// 0..=100, never decreases while a job is uploading.
    pub percent: u8,
    pub material: Option<Material>,
}

impl UploadJob {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Where queued files go. [`ApiClient`] is the real destination.
#[async_trait]
pub trait MaterialUploader: Send + Sync {
    async fn upload(
        &self,
        course_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        tags: &[String],
        progress: ProgressFn,
    ) -> Result<Material>;
}

#[async_trait]
impl MaterialUploader for ApiClient {
    async fn upload(
        &self,
        course_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        tags: &[String],
        progress: ProgressFn,
    ) -> Result<Material> {
        self.upload_material(course_id, file_name, mime_type, bytes, tags, progress)
            .await
    }
}

/// Integer percentage of `sent` over `total`, clamped to 100. An empty
/// file counts as fully sent.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (sent.min(total).saturating_mul(100) / total) as u8
}

/// Content type from the file extension; the server re-derives it when this
/// falls back to octet-stream.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub done: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct UploadQueue {
    jobs: Vec<UploadJob>,
    next_id: u64,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, course_id: &str, path: impl Into<PathBuf>, tags: Vec<String>) -> u64 {
        self.next_id += 1;
        self.jobs.push(UploadJob {
            id: self.next_id,
            course_id: course_id.to_string(),
            path: path.into(),
            tags,
            state: JobState::Queued,
            percent: 0,
            material: None,
        });
        self.next_id
    }

    /// Cancel a job that has not started. Returns whether anything changed.
    pub fn cancel(&mut self, id: u64) -> bool {
        match self.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.state == JobState::Queued => {
                job.state = JobState::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Re-queue a failed or cancelled job.
    pub fn retry(&mut self, id: u64) -> bool {
        match self.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if matches!(job.state, JobState::Failed(_) | JobState::Cancelled) => {
                job.state = JobState::Queued;
                job.percent = 0;
                true
            }
            _ => false,
        }
    }

    /// Drop done and cancelled jobs; failed ones stay for a retry.
    pub fn clear_finished(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| !j.state.is_finished());
        before - self.jobs.len()
    }

    pub fn jobs(&self) -> &[UploadJob] {
        &self.jobs
    }

    pub fn get(&self, id: u64) -> Option<&UploadJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Upload every queued job in order. `on_progress` is called whenever a
    /// job's state or percentage changes.
    pub async fn run<U, F>(&mut self, uploader: &U, mut on_progress: F) -> RunSummary
    where
        U: MaterialUploader + ?Sized,
        F: FnMut(&UploadJob),
    {
        let mut summary = RunSummary::default();
        for index in 0..self.jobs.len() {
            if self.jobs[index].state != JobState::Queued {
                continue;
            }
            let job = &mut self.jobs[index];
            job.state = JobState::Uploading;
            job.percent = 0;
            on_progress(&*job);

            match upload_one(uploader, job, &mut on_progress).await {
                Ok(material) => {
                    job.state = JobState::Done;
                    job.percent = 100;
                    job.material = Some(material);
                    summary.done += 1;
                }
                Err(e) => {
                    tracing::debug!(file = %job.path.display(), "upload failed: {e:#}");
                    job.state = JobState::Failed(format!("{e:#}"));
                    summary.failed += 1;
                }
            }
            on_progress(&*job);
        }
        summary
    }
}

async fn upload_one<U, F>(uploader: &U, job: &mut UploadJob, on_progress: &mut F) -> Result<Material>
where
    U: MaterialUploader + ?Sized,
    F: FnMut(&UploadJob),
{
    let bytes = tokio::fs::read(&job.path).await?;
    let total = bytes.len() as u64;
    let file_name = job.file_name();
    let mime_type = mime_for(&job.path);
    let course_id = job.course_id.clone();
    let tags = job.tags.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
    let progress: ProgressFn = Arc::new(move |sent| {
        let _ = tx.send(sent);
    });
    let upload = uploader.upload(&course_id, &file_name, mime_type, bytes, &tags, progress);
    tokio::pin!(upload);

    let mut report = |job: &mut UploadJob, sent: u64| {
        let pct = percent(sent, total);
        if pct > job.percent {
            job.percent = pct;
            on_progress(&*job);
        }
    };
    loop {
        tokio::select! {
            result = &mut upload => {
                while let Ok(sent) = rx.try_recv() {
                    report(&mut *job, sent);
                }
                return result;
            }
            Some(sent) = rx.recv() => report(&mut *job, sent),
        }
    }
}
