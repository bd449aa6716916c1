//! Compile-time–checked column identifiers for all tables.

use sea_query::Iden;

#[derive(Iden)]
pub enum Users {
    Table,
    Id,
    Nickname,
    Email,
    PasswordHash,
    PasswordSalt,
    ApiKeyHash,
    CreatedAt,
}

#[derive(Iden)]
pub enum RefreshTokens {
    Table,
    Id,
    UserId,
    TokenHash,
    ExpiresAt,
    CreatedAt,
}

#[derive(Iden)]
pub enum Courses {
    Table,
    Id,
    UserId,
    Name,
    Description,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
pub enum Materials {
    Table,
    Id,
    UserId,
    CourseId,
    FileName,
    MimeType,
    SizeBytes,
    StoragePath,
    Tags,
    AiStatus,
    AiFileName,
    AiFileUri,
    AiFileExpiresAt,
    CreatedAt,
}

#[derive(Iden)]
pub enum Lessons {
    Table,
    Id,
    UserId,
    CourseId,
    Title,
    LessonType,
    Topics,
    Messages,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
pub enum Flashcards {
    Table,
    Id,
    UserId,
    CourseId,
    Concept,
    Definition,
    Topic,
    Difficulty,
    CreatedAt,
}
