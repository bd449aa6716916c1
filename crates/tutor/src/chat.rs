//! Per-lesson conversation handle kept in the session cache.

use studyhall_api::{LessonMessage, MessageRole};

use crate::model::{Content, FunctionDeclaration, GenerateRequest, Part, Role, ToolMode};

/// Turns replayed to the model; older ones fall off.
pub const MAX_HISTORY_MESSAGES: usize = 40;

const MATERIALS_PREAMBLE: &str = "The study materials for this lesson are attached.";
const MATERIALS_ACK: &str = "Thanks, I have the materials and will use them.";

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub owner_id: String,
    pub system_instruction: String,
    /// Uploaded material file parts, sent ahead of the conversation.
    pub files: Vec<Part>,
    pub history: Vec<Content>,
    /// Materials that could not be attached when the session was built.
    pub failed_materials: Vec<String>,
}

impl ChatSession {
    pub fn new(
        owner_id: &str,
        system_instruction: String,
        files: Vec<Part>,
        failed_materials: Vec<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            system_instruction,
            files,
            history: Vec::new(),
            failed_materials,
        }
    }

    /// Rebuild model history from a stored message log. Quiz widgets are
    /// replayed as a short text note.
    pub fn seed_history(&mut self, messages: &[LessonMessage]) {
        let start = messages.len().saturating_sub(MAX_HISTORY_MESSAGES);
        self.history = messages[start..]
            .iter()
            .map(|m| match m.role {
                MessageRole::User => Content::user_text(m.content.clone()),
                MessageRole::Assistant => Content::model_text(assistant_text(m)),
            })
            .collect();
    }

    /// Request for the next turn. History is not modified until
    /// [`ChatSession::record_turn`] so a failed call leaves it untouched.
    pub fn request(
        &self,
        user_message: &str,
        tools: Vec<FunctionDeclaration>,
        tool_mode: ToolMode,
    ) -> GenerateRequest {
        let mut contents = Vec::with_capacity(self.history.len() + 3);
        if !self.files.is_empty() {
            let mut parts = vec![Part::Text(MATERIALS_PREAMBLE.to_string())];
            parts.extend(self.files.iter().cloned());
            contents.push(Content {
                role: Role::User,
                parts,
            });
            contents.push(Content::model_text(MATERIALS_ACK));
        }
        contents.extend(self.history.iter().cloned());
        contents.push(Content::user_text(user_message));
        GenerateRequest {
            system_instruction: self.system_instruction.clone(),
            contents,
            tools,
            tool_mode,
        }
    }

    pub fn record_turn(&mut self, user_message: &str, assistant: &LessonMessage) {
        self.history.push(Content::user_text(user_message));
        self.history
            .push(Content::model_text(assistant_text(assistant)));
        if self.history.len() > MAX_HISTORY_MESSAGES {
            let excess = self.history.len() - MAX_HISTORY_MESSAGES;
            self.history.drain(..excess);
        }
    }
}

fn assistant_text(message: &LessonMessage) -> String {
    match &message.quiz {
        Some(quiz) => {
            let note = format!(
                "[Quiz \"{}\" with {} questions was shown to the student]",
                quiz.title,
                quiz.questions.len()
            );
            if message.content.trim().is_empty() {
                note
            } else {
                format!("{}\n{note}", message.content)
            }
        }
        None => message.content.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyhall_api::{QuestionKind, Quiz, QuizQuestion};

    fn message(role: MessageRole, content: &str, quiz: Option<Quiz>) -> LessonMessage {
        LessonMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            quiz,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn request_prepends_files_and_appends_user_turn() {
        let session = ChatSession::new(
            "u1",
            "system".into(),
            vec![Part::File {
                mime_type: "application/pdf".into(),
                uri: "files/1".into(),
            }],
            Vec::new(),
        );
        let req = session.request("what is ATP?", Vec::new(), ToolMode::Auto);
        assert_eq!(req.system_instruction, "system");
        assert_eq!(req.contents.len(), 3);
        assert_eq!(req.contents[0].parts.len(), 2);
        assert_eq!(req.contents[1].role, Role::Model);
        assert_eq!(req.contents[2], Content::user_text("what is ATP?"));
        assert!(session.history.is_empty());
    }

    #[test]
    fn seeded_history_replays_quiz_as_text() {
        let quiz = Quiz {
            id: "q1".into(),
            title: "Cells".into(),
            questions: vec![QuizQuestion {
                kind: QuestionKind::TrueFalse,
                prompt: "?".into(),
                options: vec!["True".into(), "False".into()],
                answer_index: 0,
                explanation: None,
            }],
        };
        let mut session = ChatSession::new("u1", String::new(), Vec::new(), Vec::new());
        session.seed_history(&[
            message(MessageRole::User, "quiz me", None),
            message(MessageRole::Assistant, "", Some(quiz)),
        ]);
        assert_eq!(session.history.len(), 2);
        assert_eq!(
            session.history[1],
            Content::model_text("[Quiz \"Cells\" with 1 questions was shown to the student]")
        );
    }

    #[test]
    fn history_is_capped() {
        let mut session = ChatSession::new("u1", String::new(), Vec::new(), Vec::new());
        let reply = message(MessageRole::Assistant, "ok", None);
        for i in 0..MAX_HISTORY_MESSAGES {
            session.record_turn(&format!("turn {i}"), &reply);
        }
        assert_eq!(session.history.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(
            session.history.last(),
            Some(&Content::model_text("ok"))
        );
    }
}
