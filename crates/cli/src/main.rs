mod auth_cmd;
mod config;
mod courses;
mod study;
mod tutor_cmd;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use studyhall_api::LessonType;

#[derive(Parser)]
#[command(name = "studyhall", about = "studyhall CLI - courses, AI tutor and flashcards", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the session token
    Login {
        #[arg(long)]
        email: Option<String>,
    },

    /// Create an account and log in
    Register {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        nickname: Option<String>,
    },

    /// Exchange the stored refresh token for a new session
    Refresh,

    /// Forget the stored token
    Logout,

    /// Show the logged-in user
    Whoami,

    /// Show or set configuration
    Config {
        /// Set the server URL
        #[arg(long)]
        server: Option<String>,

        /// Store an API key (`shk_...`) for non-interactive use
        #[arg(long)]
        api_key: Option<String>,
    },

    /// List your courses
    Courses,

    /// Create a course
    CourseCreate {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a course with its materials and lessons
    CourseDelete { course_id: String },

    /// List a course's materials
    Materials {
        course_id: String,
        /// Only materials tagged with this topic
        #[arg(long)]
        topic: Option<String>,
    },

    /// Upload study materials to a course
    Upload {
        #[arg(long)]
        course: String,
        /// Topic tag applied to every file (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List topics, across all courses or for one
    Topics {
        #[arg(long)]
        course: Option<String>,
    },

    /// List lessons
    Lessons {
        #[arg(long)]
        course: Option<String>,
    },

    /// Start a lesson in a course
    LessonCreate {
        #[arg(long)]
        course: String,
        title: String,
        /// chat, quiz or flashcards
        #[arg(long = "type", default_value = "chat", value_parser = parse_lesson_type)]
        lesson_type: LessonType,
        #[arg(long = "topic")]
        topics: Vec<String>,
    },

    /// Print a lesson's conversation
    History { lesson_id: String },

    /// Ask the tutor a question within a lesson
    Ask { lesson_id: String, message: String },

    /// Take a quiz generated from the lesson's materials
    Quiz {
        lesson_id: String,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        count: Option<u32>,
    },

    /// Generate flashcards from a course's materials
    Generate {
        #[arg(long)]
        course: String,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        count: Option<u32>,
    },

    /// Review flashcards
    Study {
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
}

fn parse_lesson_type(s: &str) -> Result<LessonType, String> {
    LessonType::parse(&s.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown lesson type `{s}` (chat, quiz, flashcards)"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Login { email } => auth_cmd::run_login(email).await,
        Commands::Register { email, nickname } => auth_cmd::run_register(email, nickname).await,
        Commands::Refresh => auth_cmd::run_refresh().await,
        Commands::Logout => auth_cmd::run_logout(),
        Commands::Whoami => auth_cmd::run_whoami().await,
        Commands::Config { server, api_key } => config::run_config(server, api_key),
        Commands::Courses => courses::run_list().await,
        Commands::CourseCreate { name, description } => courses::run_create(name, description).await,
        Commands::CourseDelete { course_id } => courses::run_delete(&course_id).await,
        Commands::Materials { course_id, topic } => {
            courses::run_materials(&course_id, topic.as_deref()).await
        }
        Commands::Upload {
            course,
            tags,
            files,
        } => courses::run_upload(&course, files, tags).await,
        Commands::Topics { course } => courses::run_topics(course.as_deref()).await,
        Commands::Lessons { course } => tutor_cmd::run_lessons(course.as_deref()).await,
        Commands::LessonCreate {
            course,
            title,
            lesson_type,
            topics,
        } => tutor_cmd::run_lesson_create(course, title, lesson_type, topics).await,
        Commands::History { lesson_id } => tutor_cmd::run_history(&lesson_id).await,
        Commands::Ask { lesson_id, message } => tutor_cmd::run_ask(&lesson_id, &message).await,
        Commands::Quiz {
            lesson_id,
            topic,
            count,
        } => tutor_cmd::run_quiz(&lesson_id, topic, count).await,
        Commands::Generate {
            course,
            topic,
            count,
        } => study::run_generate(course, topic, count).await,
        Commands::Study {
            course,
            topic,
            limit,
        } => study::run_study(course, topic, limit).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
