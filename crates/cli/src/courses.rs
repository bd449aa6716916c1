use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};

use studyhall_api::CreateCourseRequest;
use studyhall_api_client::{JobState, UploadQueue};

use crate::config::{client, load_config};

pub async fn run_list() -> Result<()> {
    let config = load_config()?;
    let resp = client(&config)?.list_courses().await?;
    if resp.courses.is_empty() {
        println!("No courses yet. Create one with `studyhall course-create <name>`.");
        return Ok(());
    }
    for course in resp.courses {
        println!(
            "{}  {}  ({} materials)",
            course.id, course.name, course.material_count
        );
    }
    Ok(())
}

pub async fn run_create(name: String, description: Option<String>) -> Result<()> {
    let config = load_config()?;
    let course = client(&config)?
        .create_course(&CreateCourseRequest { name, description })
        .await?;
    println!("Created course {} ({})", course.name, course.id);
    Ok(())
}

pub async fn run_delete(course_id: &str) -> Result<()> {
    let config = load_config()?;
    client(&config)?.delete_course(course_id).await?;
    println!("Deleted course {course_id}");
    Ok(())
}

pub async fn run_materials(course_id: &str, topic: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let resp = client(&config)?.list_materials(course_id, topic).await?;
    for m in resp.materials {
        let tags = if m.tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", m.tags.join(", "))
        };
        println!("{}  {}  {} bytes{tags}", m.id, m.file_name, m.size_bytes);
    }
    Ok(())
}

pub async fn run_topics(course_id: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let resp = client(&config)?.list_topics(course_id).await?;
    if resp.topics.is_empty() {
        println!("No topics. Tag materials on upload with --tag.");
    }
    for topic in resp.topics {
        println!("{:<32} {}", topic.name, topic.material_count);
    }
    Ok(())
}

/// Upload files one by one, printing a progress line per job.
pub async fn run_upload(course_id: &str, files: Vec<PathBuf>, tags: Vec<String>) -> Result<()> {
    if files.is_empty() {
        bail!("no files given");
    }
    let config = load_config()?;
    let api = client(&config)?;

    let mut queue = UploadQueue::new();
    for file in files {
        if !file.is_file() {
            bail!("File not found: {}", file.display());
        }
        queue.push(course_id, file, tags.clone());
    }

    let summary = queue
        .run(&api, |job| match &job.state {
            JobState::Uploading => {
                print!("\r{:<40} {:>3}%", job.file_name(), job.percent);
                let _ = std::io::stdout().flush();
            }
            JobState::Done => println!("\r{:<40} done", job.file_name()),
            JobState::Failed(reason) => println!("\r{:<40} failed: {reason}", job.file_name()),
            JobState::Queued | JobState::Cancelled => {}
        })
        .await;

    println!("{} uploaded, {} failed", summary.done, summary.failed);
    if summary.failed > 0 {
        bail!("{} upload(s) failed", summary.failed);
    }
    Ok(())
}
