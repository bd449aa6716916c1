use anyhow::{Result, bail};
use dialoguer::Select;

use studyhall_api::{
    ChatResponse, CreateLessonRequest, GradeQuizRequest, LessonType, Quiz, QuizRequest,
};
use studyhall_api_client::ApiClient;

use crate::config::{client, load_config};

pub async fn run_lessons(course_id: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let resp = client(&config)?.list_lessons(course_id).await?;
    for lesson in resp.lessons {
        println!(
            "{}  {}  [{}]  {} messages",
            lesson.id,
            lesson.title,
            lesson.lesson_type.as_str(),
            lesson.message_count
        );
    }
    Ok(())
}

pub async fn run_lesson_create(
    course_id: String,
    title: String,
    lesson_type: LessonType,
    topics: Vec<String>,
) -> Result<()> {
    let config = load_config()?;
    let lesson = client(&config)?
        .create_lesson(&CreateLessonRequest {
            course_id,
            title,
            lesson_type,
            topics,
        })
        .await?;
    println!("Created lesson {} ({})", lesson.title, lesson.id);
    Ok(())
}

/// Print a lesson's message log.
pub async fn run_history(lesson_id: &str) -> Result<()> {
    let config = load_config()?;
    let lesson = client(&config)?.get_lesson(lesson_id).await?;
    println!("# {}", lesson.title);
    for message in &lesson.messages {
        println!();
        println!("{:?}: {}", message.role, message.content);
        if let Some(quiz) = &message.quiz {
            println!("  (quiz {}: {} questions)", quiz.id, quiz.questions.len());
        }
    }
    Ok(())
}

pub async fn run_ask(lesson_id: &str, message: &str) -> Result<()> {
    let config = load_config()?;
    let api = client(&config)?;
    let resp = api.chat(lesson_id, message).await?;
    print_reply(&resp);
    if let Some(quiz) = resp.message.quiz.clone() {
        take_quiz(&api, lesson_id, &quiz).await?;
    }
    Ok(())
}

pub async fn run_quiz(lesson_id: &str, topic: Option<String>, count: Option<u32>) -> Result<()> {
    let config = load_config()?;
    let api = client(&config)?;
    let resp = api
        .quiz(
            lesson_id,
            &QuizRequest {
                topic,
                question_count: count,
            },
        )
        .await?;
    print_reply(&resp);
    let Some(quiz) = resp.message.quiz else {
        bail!("the tutor did not return a quiz");
    };
    take_quiz(&api, lesson_id, &quiz).await
}

fn print_reply(resp: &ChatResponse) {
    if !resp.failed_materials.is_empty() {
        eprintln!(
            "warning: could not attach {}",
            resp.failed_materials.join(", ")
        );
    }
    if !resp.message.content.trim().is_empty() {
        println!("{}", resp.message.content);
    }
}

/// Ask each question interactively, then submit the answers for grading.
async fn take_quiz(api: &ApiClient, lesson_id: &str, quiz: &Quiz) -> Result<()> {
    println!();
    println!("== {} ==", quiz.title);
    let mut answers = Vec::with_capacity(quiz.questions.len());
    for (i, question) in quiz.questions.iter().enumerate() {
        println!();
        let mut items: Vec<&str> = question.options.iter().map(String::as_str).collect();
        items.push("(skip)");
        let choice = Select::new()
            .with_prompt(format!("{}. {}", i + 1, question.prompt))
            .items(&items)
            .default(0)
            .interact()?;
        answers.push((choice < question.options.len()).then_some(choice));
    }

    let grade = api
        .grade_quiz(lesson_id, &quiz.id, &GradeQuizRequest { answers })
        .await?;
    println!();
    for result in &grade.results {
        let Some(question) = quiz.questions.get(result.index) else {
            continue;
        };
        if result.correct {
            println!("{}. correct", result.index + 1);
        } else {
            let expected = question
                .options
                .get(result.expected)
                .map(String::as_str)
                .unwrap_or("?");
            println!("{}. wrong, answer: {expected}", result.index + 1);
        }
        if let Some(explanation) = &question.explanation {
            println!("   {explanation}");
        }
    }
    println!("Score: {}/{}", grade.correct, grade.total);
    Ok(())
}
