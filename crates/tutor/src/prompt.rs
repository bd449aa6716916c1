//! System prompt and material context assembly.

use studyhall_api::{Course, LessonType};

use crate::model::Part;

/// Upper bound on inlined material text across one context, in characters.
pub const INLINE_CHAR_BUDGET: usize = 60_000;

const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// Materials prepared for one lesson: uploaded file parts, inlined text, and
/// the names of files that could not be attached.
#[derive(Debug, Clone, Default)]
pub struct MaterialContext {
    files: Vec<Part>,
    sections: Vec<ContextSection>,
    failed: Vec<String>,
    inline_chars: usize,
}

#[derive(Debug, Clone)]
struct ContextSection {
    file_name: String,
    tags: Vec<String>,
    inline: Option<String>,
}

impl MaterialContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A material uploaded to the provider; the model reads the file itself.
    pub fn add_file(&mut self, file_name: &str, tags: &[String], part: Part) {
        self.files.push(part);
        self.sections.push(ContextSection {
            file_name: file_name.to_string(),
            tags: tags.to_vec(),
            inline: None,
        });
    }

    /// A small text material embedded in the prompt. Text beyond the shared
    /// budget is cut.
    pub fn add_inline(&mut self, file_name: &str, tags: &[String], text: &str) {
        let remaining = INLINE_CHAR_BUDGET.saturating_sub(self.inline_chars);
        let body = truncate_chars(text.trim(), remaining);
        self.inline_chars += body.chars().count();
        self.sections.push(ContextSection {
            file_name: file_name.to_string(),
            tags: tags.to_vec(),
            inline: Some(body),
        });
    }

    pub fn add_failed(&mut self, file_name: &str) {
        self.failed.push(file_name.to_string());
    }

    pub fn files(&self) -> &[Part] {
        &self.files
    }

    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Textual description of the attached materials for the system prompt.
    pub fn context_block(&self) -> String {
        if self.sections.is_empty() {
            return "No course materials are available for this lesson. Answer from general \
                    knowledge and say so when it matters."
                .to_string();
        }
        let mut out = String::from("Course materials for this lesson:\n");
        for section in &self.sections {
            out.push_str("\n### ");
            out.push_str(&section.file_name);
            if !section.tags.is_empty() {
                out.push_str(" (topics: ");
                out.push_str(&section.tags.join(", "));
                out.push(')');
            }
            out.push('\n');
            match &section.inline {
                Some(text) => {
                    out.push_str(text);
                    out.push('\n');
                }
                None => out.push_str("[attached file]\n"),
            }
        }
        if !self.failed.is_empty() {
            out.push_str("\nThese materials could not be loaded: ");
            out.push_str(&self.failed.join(", "));
            out.push('\n');
        }
        out
    }
}

/// Cut `text` to at most `max` characters, marking the cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

pub fn system_prompt(
    course: &Course,
    lesson_type: LessonType,
    topics: &[String],
    context: &MaterialContext,
) -> String {
    let mut out = format!(
        "You are a patient, encouraging study tutor for the course \"{}\".\n",
        course.name
    );
    if let Some(description) = course.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&format!("Course description: {}\n", description.trim()));
    }
    if !topics.is_empty() {
        out.push_str(&format!(
            "This lesson focuses on: {}.\n",
            topics.join(", ")
        ));
    }
    out.push_str(match lesson_type {
        LessonType::Chat => {
            "Explain concepts clearly, check understanding with short questions, and ground \
             your answers in the course materials. When the student asks to be quizzed, call \
             the create_quiz tool instead of writing the questions as text.\n"
        }
        LessonType::Quiz => {
            "This is a quiz lesson. Prefer testing the student with the create_quiz tool, then \
             discuss their mistakes.\n"
        }
        LessonType::Flashcards => {
            "This is a flashcard lesson. Focus on key terms and concise definitions the student \
             can memorise.\n"
        }
    });
    out.push_str("Use Markdown for formatting.\n\n");
    out.push_str(&context.context_block());
    out
}

pub fn quiz_instruction(topic: Option<&str>, question_count: u32) -> String {
    match topic {
        Some(topic) => format!(
            "Create a quiz with {question_count} questions about \"{topic}\" from the course \
             materials, mixing multiple-choice and true/false questions."
        ),
        None => format!(
            "Create a quiz with {question_count} questions covering the course materials, \
             mixing multiple-choice and true/false questions."
        ),
    }
}

pub fn flashcard_instruction(topic: Option<&str>, count: u32) -> String {
    match topic {
        Some(topic) => format!(
            "Create {count} flashcards about \"{topic}\" from the course materials. Set each \
             card's topic to \"{topic}\"."
        ),
        None => format!(
            "Create {count} flashcards covering the most important concepts in the course \
             materials. Give each card a short topic."
        ),
    }
}
