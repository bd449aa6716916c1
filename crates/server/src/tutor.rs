//! Server-side tutor state: the configured model and the lesson chat cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use studyhall_api::{Course, Lesson, LessonMessage, LessonType, db, service};
use studyhall_tutor::{ChatSession, GenerativeModel, SessionCache, TutorError, prompt};

use crate::error::ApiErr;
use crate::ingest;
use crate::objects::ObjectStore;
use crate::storage::{Db, course_from_row, material_from_row, sq_query_map, sq_query_row};

/// Cached sessions plus invalidation counters. Every invalidation bumps the
/// counter of the lesson or course it targets, so a session built while one
/// happened can be recognised as stale.
struct Sessions {
    cache: SessionCache<ChatSession>,
    generations: HashMap<String, u64>,
    builds: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Sessions {
    fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        *self.generations.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Invalidation counters of a lesson and its course, taken before a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStamp {
    lesson: u64,
    course: u64,
}

#[derive(Clone)]
pub struct TutorState {
    model: Option<Arc<dyn GenerativeModel>>,
    sessions: Arc<Mutex<Sessions>>,
}

impl TutorState {
    pub fn new(model: Option<Arc<dyn GenerativeModel>>, capacity: usize, ttl: Duration) -> Self {
        Self {
            model,
            sessions: Arc::new(Mutex::new(Sessions {
                cache: SessionCache::new(capacity, ttl),
                generations: HashMap::new(),
                builds: HashMap::new(),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Result<Arc<dyn GenerativeModel>, ApiErr> {
        self.model
            .clone()
            .ok_or_else(|| ApiErr::from(TutorError::NotConfigured))
    }

    // Losing the cache only forces a rebuild, so a poisoned lock is reused.
    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached(&self, lesson_id: &str, owner_id: &str) -> Option<ChatSession> {
        let mut sessions = self.sessions();
        let session = sessions.cache.get(lesson_id, Instant::now())?;
        (session.owner_id == owner_id).then(|| session.clone())
    }

    pub fn stamp(&self, lesson_id: &str, course_id: &str) -> BuildStamp {
        let sessions = self.sessions();
        BuildStamp {
            lesson: sessions.generation(lesson_id),
            course: sessions.generation(course_id),
        }
    }

    /// Cache a freshly built session unless its lesson or course was
    /// invalidated after `stamp` was taken. Returns whether it was stored.
    pub fn store(&self, lesson: &Lesson, stamp: BuildStamp, session: ChatSession) -> bool {
        let mut sessions = self.sessions();
        let current = BuildStamp {
            lesson: sessions.generation(&lesson.id),
            course: sessions.generation(&lesson.course_id),
        };
        if current != stamp {
            tracing::debug!(lesson_id = %lesson.id, "materials changed during build; not caching");
            return false;
        }
        let evicted = sessions
            .cache
            .insert(lesson.id.clone(), session, Instant::now());
        if let Some(evicted) = evicted {
            tracing::debug!(lesson_id = %evicted, "evicted chat session");
        }
        true
    }

    /// Append a completed turn to a cached session, if one is still live.
    pub fn record_turn(&self, lesson_id: &str, user_message: &str, assistant: &LessonMessage) {
        if let Some(session) = self.sessions().cache.get(lesson_id, Instant::now()) {
            session.record_turn(user_message, assistant);
        }
    }

    pub fn invalidate<'a>(&self, lesson_ids: impl IntoIterator<Item = &'a str>) {
        let mut sessions = self.sessions();
        for id in lesson_ids {
            sessions.bump(id);
            sessions.cache.remove(id);
        }
    }

    /// Drop idle sessions; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.sessions().cache.purge_expired(Instant::now())
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions().cache.len()
    }

    /// Drop every cached session of a course (its materials changed).
    pub fn invalidate_course(&self, db: &Db, user_id: &str, course_id: &str) {
        self.sessions().bump(course_id);
        let ids = {
            let conn = db.conn();
            sq_query_map(&conn, db::lessons::ids_by_course(user_id, course_id), |row| {
                row.get::<_, String>(0)
            })
        };
        match ids {
            Ok(ids) => self.invalidate(ids.iter().map(String::as_str)),
            Err(e) => tracing::error!("list lessons for cache invalidation: {e}"),
        }
    }

    fn build_lock(&self, lesson_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sessions()
            .builds
            .entry(lesson_id.to_string())
            .or_default()
            .clone()
    }

    fn release_build_lock(&self, lesson_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut sessions = self.sessions();
        if sessions
            .builds
            .get(lesson_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            sessions.builds.remove(lesson_id);
        }
    }

    /// Cached session for a lesson, or a freshly built one. Builds for the
    /// same lesson run one at a time, so concurrent first turns share one
    /// upload. Sessions whose materials partly failed are not cached so the
    /// next turn retries them.
    pub async fn open_session(
        &self,
        db: &Db,
        store: &ObjectStore,
        user_id: &str,
        lesson: &Lesson,
    ) -> Result<ChatSession, ApiErr> {
        if let Some(session) = self.cached(&lesson.id, user_id) {
            return Ok(session);
        }
        let model = self.model()?;
        let lock = self.build_lock(&lesson.id);
        let result = {
            let _building = lock.lock().await;
            match self.cached(&lesson.id, user_id) {
                Some(session) => Ok(session),
                None => self.build_and_store(db, store, model.as_ref(), user_id, lesson).await,
            }
        };
        self.release_build_lock(&lesson.id, lock);
        result
    }

    async fn build_and_store(
        &self,
        db: &Db,
        store: &ObjectStore,
        model: &dyn GenerativeModel,
        user_id: &str,
        lesson: &Lesson,
    ) -> Result<ChatSession, ApiErr> {
        let stamp = self.stamp(&lesson.id, &lesson.course_id);
        let mut session = build_course_session(
            db,
            store,
            model,
            user_id,
            &lesson.course_id,
            lesson.lesson_type,
            &lesson.topics,
        )
        .await?;
        session.seed_history(&lesson.messages);
        let cached = session.failed_materials.is_empty() && self.store(lesson, stamp, session.clone());
        tracing::info!(
            lesson_id = %lesson.id,
            files = session.files.len(),
            failed = session.failed_materials.len(),
            cached,
            "opened chat session"
        );
        Ok(session)
    }
}

/// Ingest the course materials that match `topics` and wrap them in a
/// session with the matching system prompt.
pub async fn build_course_session(
    db: &Db,
    store: &ObjectStore,
    model: &dyn GenerativeModel,
    user_id: &str,
    course_id: &str,
    lesson_type: LessonType,
    topics: &[String],
) -> Result<ChatSession, ApiErr> {
    let (course, materials): (Course, _) = {
        let conn = db.conn();
        let course = sq_query_row(&conn, db::courses::get(user_id, course_id), course_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ApiErr::not_found("course not found"),
                e => ApiErr::from_db("load course")(e),
            })?;
        let materials = sq_query_map(
            &conn,
            db::materials::list_by_course(user_id, course_id),
            material_from_row,
        )
        .map_err(ApiErr::from_db("list course materials"))?;
        (course, materials)
    };

    let selected: Vec<_> = materials
        .into_iter()
        .filter(|m| service::material_matches_topics(&m.material, topics))
        .collect();
    let ctx = ingest::build_context(db, store, model, user_id, &selected).await;
    let system = prompt::system_prompt(&course, lesson_type, topics, &ctx);
    Ok(ChatSession::new(
        user_id,
        system,
        ctx.files().to_vec(),
        ctx.failed().to_vec(),
    ))
}
