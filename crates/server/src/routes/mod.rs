pub mod auth;
pub mod capabilities;
pub mod chat;
pub mod courses;
pub mod files;
pub mod flashcards;
pub mod health;
pub mod lessons;
pub mod materials;
pub mod topics;
