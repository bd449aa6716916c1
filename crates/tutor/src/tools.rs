//! Tool declarations offered to the model and parsing of its tool calls.
//!
//! Model output is untrusted: questions that cannot be graded are dropped,
//! and a call that yields nothing usable is an error.

use serde::Deserialize;
use studyhall_api::{Difficulty, QuestionKind, Quiz, QuizQuestion};

use crate::model::{FunctionCall, FunctionDeclaration};
use crate::TutorError;

pub const CREATE_QUIZ: &str = "create_quiz";
pub const CREATE_FLASHCARDS: &str = "create_flashcards";

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 6;
pub const MAX_QUESTIONS: usize = 20;
pub const MAX_FLASHCARDS: usize = 50;

pub fn quiz_tool() -> FunctionDeclaration {
    FunctionDeclaration {
        name: CREATE_QUIZ.to_string(),
        description: "Create an interactive quiz for the student. Use it whenever the student \
                      asks to be quizzed or tested. Every question must be answerable from the \
                      course materials."
            .to_string(),
        parameters: serde_json::json!({
            "type": "OBJECT",
            "properties": {
                "title": { "type": "STRING", "description": "Short quiz title" },
                "questions": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "kind": {
                                "type": "STRING",
                                "enum": ["multiple_choice", "true_false"]
                            },
                            "prompt": { "type": "STRING" },
                            "options": {
                                "type": "ARRAY",
                                "items": { "type": "STRING" },
                                "description": "2-6 choices for multiple_choice; omit for true_false"
                            },
                            "answer_index": {
                                "type": "INTEGER",
                                "description": "Zero-based index of the correct option. For true_false: 0 = True, 1 = False"
                            },
                            "explanation": { "type": "STRING" }
                        },
                        "required": ["kind", "prompt", "answer_index"]
                    }
                }
            },
            "required": ["title", "questions"]
        }),
    }
}

pub fn flashcard_tool() -> FunctionDeclaration {
    FunctionDeclaration {
        name: CREATE_FLASHCARDS.to_string(),
        description: "Create study flashcards, each pairing a concept with a concise definition."
            .to_string(),
        parameters: serde_json::json!({
            "type": "OBJECT",
            "properties": {
                "cards": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "concept": { "type": "STRING" },
                            "definition": { "type": "STRING" },
                            "topic": { "type": "STRING" },
                            "difficulty": {
                                "type": "STRING",
                                "enum": ["easy", "medium", "hard"]
                            }
                        },
                        "required": ["concept", "definition"]
                    }
                }
            },
            "required": ["cards"]
        }),
    }
}

#[derive(Deserialize)]
struct RawQuiz {
    #[serde(default)]
    title: String,
    #[serde(default)]
    questions: Vec<RawQuestion>,
}

#[derive(Deserialize)]
struct RawQuestion {
    #[serde(default)]
    kind: String,
    #[serde(default, alias = "question")]
    prompt: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    answer_index: Option<f64>,
    #[serde(default)]
    explanation: Option<String>,
}

fn parse_kind(raw: &str, option_count: usize) -> QuestionKind {
    match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
        "true_false" | "truefalse" | "boolean" | "tf" => QuestionKind::TrueFalse,
        "multiple_choice" | "multiplechoice" | "mcq" => QuestionKind::MultipleChoice,
        _ if option_count == 0 => QuestionKind::TrueFalse,
        _ => QuestionKind::MultipleChoice,
    }
}

fn answer_index(raw: Option<f64>) -> Option<usize> {
    let v = raw?;
    (v >= 0.0 && v.fract() == 0.0 && v <= MAX_OPTIONS as f64).then_some(v as usize)
}

fn normalize_question(raw: RawQuestion) -> Option<QuizQuestion> {
    let prompt = raw.prompt.trim().to_string();
    if prompt.is_empty() {
        return None;
    }
    let options: Vec<String> = raw
        .options
        .iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    let kind = parse_kind(&raw.kind, options.len());
    let options = match kind {
        QuestionKind::TrueFalse => vec!["True".to_string(), "False".to_string()],
        QuestionKind::MultipleChoice => {
            if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
                return None;
            }
            options
        }
    };
    let answer_index = answer_index(raw.answer_index).filter(|i| *i < options.len())?;
    let explanation = raw
        .explanation
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    Some(QuizQuestion {
        kind,
        prompt,
        options,
        answer_index,
        explanation,
    })
}

/// Turn a `create_quiz` call into a gradeable [`Quiz`] with a fresh id.
pub fn parse_quiz(call: &FunctionCall) -> Result<Quiz, TutorError> {
    if call.name != CREATE_QUIZ {
        return Err(TutorError::InvalidToolCall(format!(
            "expected {CREATE_QUIZ}, got {}",
            call.name
        )));
    }
    let raw: RawQuiz = serde_json::from_value(call.args.clone())
        .map_err(|e| TutorError::InvalidToolCall(format!("quiz arguments: {e}")))?;
    let total = raw.questions.len();
    let questions: Vec<QuizQuestion> = raw
        .questions
        .into_iter()
        .filter_map(normalize_question)
        .take(MAX_QUESTIONS)
        .collect();
    if questions.is_empty() {
        return Err(TutorError::InvalidToolCall(
            "quiz contained no valid questions".to_string(),
        ));
    }
    if questions.len() < total.min(MAX_QUESTIONS) {
        tracing::debug!(
            kept = questions.len(),
            total,
            "dropped malformed quiz questions"
        );
    }
    let title = match raw.title.trim() {
        "" => "Quiz".to_string(),
        t => t.to_string(),
    };
    Ok(Quiz {
        id: uuid::Uuid::new_v4().to_string(),
        title,
        questions,
    })
}

/// A generated flashcard before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashcardDraft {
    pub concept: String,
    pub definition: String,
    pub topic: Option<String>,
    pub difficulty: Difficulty,
}

#[derive(Deserialize)]
struct RawDeck {
    #[serde(default, alias = "flashcards")]
    cards: Vec<RawCard>,
}

#[derive(Deserialize)]
struct RawCard {
    #[serde(default, alias = "term")]
    concept: String,
    #[serde(default)]
    definition: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
}

/// Turn a `create_flashcards` call into drafts. Cards missing a concept or
/// definition are dropped; unknown difficulties become medium.
pub fn parse_flashcards(call: &FunctionCall) -> Result<Vec<FlashcardDraft>, TutorError> {
    if call.name != CREATE_FLASHCARDS {
        return Err(TutorError::InvalidToolCall(format!(
            "expected {CREATE_FLASHCARDS}, got {}",
            call.name
        )));
    }
    let raw: RawDeck = serde_json::from_value(call.args.clone())
        .map_err(|e| TutorError::InvalidToolCall(format!("flashcard arguments: {e}")))?;
    let drafts: Vec<FlashcardDraft> = raw
        .cards
        .into_iter()
        .filter_map(|card| {
            let concept = card.concept.trim().to_string();
            let definition = card.definition.trim().to_string();
            if concept.is_empty() || definition.is_empty() {
                return None;
            }
            Some(FlashcardDraft {
                concept,
                definition,
                topic: card
                    .topic
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
                difficulty: card
                    .difficulty
                    .as_deref()
                    .and_then(Difficulty::parse)
                    .unwrap_or_default(),
            })
        })
        .take(MAX_FLASHCARDS)
        .collect();
    if drafts.is_empty() {
        return Err(TutorError::InvalidToolCall(
            "no valid flashcards were generated".to_string(),
        ));
    }
    Ok(drafts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: serde_json::Value) -> FunctionCall {
        FunctionCall {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn quiz_keeps_valid_questions_and_drops_the_rest() {
        let quiz = parse_quiz(&call(
            CREATE_QUIZ,
            json!({
                "title": " Cell biology ",
                "questions": [
                    {"kind": "multiple_choice", "prompt": "Powerhouse of the cell?",
                     "options": ["Nucleus", "Mitochondria", "Ribosome"], "answer_index": 1,
                     "explanation": "ATP"},
                    {"kind": "multiple_choice", "prompt": "Only one option", "options": ["A"], "answer_index": 0},
                    {"kind": "multiple_choice", "prompt": "Out of range", "options": ["A", "B"], "answer_index": 5},
                    {"kind": "true_false", "prompt": "Cells have membranes.", "answer_index": 0.0},
                    {"kind": "true_false", "prompt": "   ", "answer_index": 0}
                ]
            }),
        ))
        .unwrap();
        assert_eq!(quiz.title, "Cell biology");
        assert_eq!(quiz.questions.len(), 2);
        assert_eq!(quiz.questions[0].answer_index, 1);
        assert_eq!(quiz.questions[1].kind, QuestionKind::TrueFalse);
        assert_eq!(quiz.questions[1].options, vec!["True", "False"]);
        assert!(!quiz.id.is_empty());
    }

    #[test]
    fn true_false_options_are_canonical_even_when_model_sends_others() {
        let quiz = parse_quiz(&call(
            CREATE_QUIZ,
            json!({"questions": [{"kind": "true_false", "prompt": "Sky is blue",
                    "options": ["Yes", "No", "Maybe"], "answer_index": 1}]}),
        ))
        .unwrap();
        assert_eq!(quiz.title, "Quiz");
        assert_eq!(quiz.questions[0].options, vec!["True", "False"]);
        assert_eq!(quiz.questions[0].answer_index, 1);
    }

    #[test]
    fn quiz_with_no_valid_questions_is_rejected() {
        let err = parse_quiz(&call(
            CREATE_QUIZ,
            json!({"title": "x", "questions": [{"kind": "multiple_choice", "prompt": "?", "options": [], "answer_index": 0}]}),
        ))
        .unwrap_err();
        assert!(matches!(err, TutorError::InvalidToolCall(_)));
        assert!(parse_quiz(&call(CREATE_FLASHCARDS, json!({}))).is_err());
    }

    #[test]
    fn fractional_or_negative_answer_is_dropped() {
        assert_eq!(answer_index(Some(1.5)), None);
        assert_eq!(answer_index(Some(-1.0)), None);
        assert_eq!(answer_index(Some(2.0)), Some(2));
        assert_eq!(answer_index(None), None);
    }

    #[test]
    fn flashcards_default_unknown_difficulty_to_medium() {
        let drafts = parse_flashcards(&call(
            CREATE_FLASHCARDS,
            json!({"cards": [
                {"concept": "Osmosis", "definition": "Diffusion of water", "topic": "Cells", "difficulty": "HARD"},
                {"concept": "Mitosis", "definition": "Cell division", "difficulty": "brutal"},
                {"concept": "", "definition": "orphan"}
            ]}),
        ))
        .unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].difficulty, Difficulty::Hard);
        assert_eq!(drafts[0].topic.as_deref(), Some("Cells"));
        assert_eq!(drafts[1].difficulty, Difficulty::Medium);
        assert_eq!(drafts[1].topic, None);
    }

    #[test]
    fn empty_deck_is_rejected() {
        assert!(parse_flashcards(&call(CREATE_FLASHCARDS, json!({"cards": []}))).is_err());
    }
}
