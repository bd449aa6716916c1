//! Flashcard review and generation.

use std::collections::VecDeque;

use anyhow::{Result, bail};
use dialoguer::Select;

use studyhall_api::{Flashcard, GenerateFlashcardsRequest, StudyQuery};

use crate::config::{client, load_config};

/// Outcome of one look at a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Known,
    Again,
}

/// Review session over a fixed set of cards. Cards marked `Again` go to the
/// back of the queue until they are known.
#[derive(Debug)]
pub struct StudyDeck {
    queue: VecDeque<Flashcard>,
    revealed: bool,
    known: usize,
    reviews: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeckSummary {
    pub known: usize,
    pub reviews: usize,
    pub remaining: usize,
}

impl StudyDeck {
    pub fn new(cards: Vec<Flashcard>) -> Self {
        Self {
            queue: cards.into(),
            revealed: false,
            known: 0,
            reviews: 0,
        }
    }

    pub fn current(&self) -> Option<&Flashcard> {
        self.queue.front()
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    /// Show the definition of the current card.
    pub fn reveal(&mut self) -> Option<&str> {
        let card = self.queue.front()?;
        self.revealed = true;
        Some(&card.definition)
    }

    pub fn answer(&mut self, answer: Answer) {
        let Some(card) = self.queue.pop_front() else {
            return;
        };
        self.reviews += 1;
        self.revealed = false;
        match answer {
            Answer::Known => self.known += 1,
            Answer::Again => self.queue.push_back(card),
        }
    }

    pub fn is_done(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn summary(&self) -> DeckSummary {
        DeckSummary {
            known: self.known,
            reviews: self.reviews,
            remaining: self.queue.len(),
        }
    }
}

pub async fn run_study(course_id: Option<String>, topic: Option<String>, limit: Option<u32>) -> Result<()> {
    let config = load_config()?;
    let api = client(&config)?;
    let deck = api
        .study_deck(&StudyQuery {
            course_id,
            topic,
            limit,
        })
        .await?;
    if deck.cards.is_empty() {
        println!("No flashcards to study. Try `studyhall generate --course <id>`.");
        return Ok(());
    }

    let total = deck.cards.len();
    let mut deck = StudyDeck::new(deck.cards);
    while let Some(card) = deck.current() {
        let topic = card.topic.as_deref().unwrap_or("general");
        println!();
        println!("[{topic} · {}] {}", card.difficulty.as_str(), card.concept);
        let choice = Select::new()
            .items(&["Show definition", "Quit"])
            .default(0)
            .interact()?;
        if choice == 1 {
            break;
        }
        if let Some(definition) = deck.reveal() {
            println!("  {definition}");
        }
        let choice = Select::new()
            .items(&["Got it", "Again", "Quit"])
            .default(0)
            .interact()?;
        match choice {
            0 => deck.answer(Answer::Known),
            1 => deck.answer(Answer::Again),
            _ => break,
        }
    }

    let summary = deck.summary();
    println!();
    println!(
        "Known {}/{total} after {} reviews ({} left)",
        summary.known, summary.reviews, summary.remaining
    );
    Ok(())
}

pub async fn run_generate(course_id: String, topic: Option<String>, count: Option<u32>) -> Result<()> {
    let config = load_config()?;
    let api = client(&config)?;
    println!("Generating flashcards...");
    let resp = api
        .generate_flashcards(&GenerateFlashcardsRequest {
            course_id,
            topic,
            count,
        })
        .await?;
    if resp.flashcards.is_empty() {
        bail!("no flashcards were generated");
    }
    for card in &resp.flashcards {
        println!("  {}: {}", card.concept, card.definition);
    }
    println!("Created {} flashcards.", resp.flashcards.len());
    Ok(())
}
