#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bloom-queue** – durable, file-backed queues for agent-to-human
//! interaction: questions an agent asks and interjections a human
//! files against a running task.
//!
//! Each record is one JSON file under `.questions/` or
//! `.interjections/`, written atomically (temp file, then rename).
//! There is no dedicated IPC channel between a write and a watcher —
//! subscribers learn about changes by periodically re-scanning both
//! directories and diffing against what they last saw, so even a
//! writer observes its own write asynchronously, same as any other
//! subscriber. This crate carries no filesystem-notification
//! dependency; the periodic scan is the only delivery mechanism rather
//! than a fallback for one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bloom_types::{Interjection, InterjectionStatus, Question, QuestionStatus};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A record file could not be parsed as JSON.
    #[error("failed to parse record: {0}")]
    Parse(#[from] serde_json::Error),
}

/// An event delivered to [`HumanQueue::watch`] subscribers, discovered
/// by diffing two directory scans. `record` carries the record as it
/// was seen at scan time; it is `None` for deletions.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum QueueEvent {
    /// A new question file appeared.
    QuestionAdded {
        /// Question id.
        id: String,
        /// The question as seen at scan time.
        record: Question,
    },
    /// An existing question transitioned to `answered`.
    QuestionAnswered {
        /// Question id.
        id: String,
        /// The question as seen at scan time.
        record: Question,
    },
    /// A question file disappeared.
    QuestionDeleted {
        /// Question id.
        id: String,
    },
    /// A new interjection file appeared.
    InterjectionAdded {
        /// Interjection id.
        id: String,
        /// The interjection as seen at scan time.
        record: Interjection,
    },
    /// An existing interjection transitioned to `resumed`.
    InterjectionResumed {
        /// Interjection id.
        id: String,
        /// The interjection as seen at scan time.
        record: Interjection,
    },
    /// An existing interjection transitioned to `dismissed`.
    InterjectionDismissed {
        /// Interjection id.
        id: String,
        /// The interjection as seen at scan time.
        record: Interjection,
    },
    /// An interjection file disappeared.
    InterjectionDeleted {
        /// Interjection id.
        id: String,
    },
}

/// Opaque handle returned by [`HumanQueue::watch`]; pass to
/// [`HumanQueue::unwatch`] to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHandle(u64);

type Handler = Arc<dyn Fn(QueueEvent) + Send + Sync>;

struct Handlers {
    next_id: u64,
    entries: Vec<(u64, Handler)>,
    poller: Option<tokio::task::JoinHandle<()>>,
}

/// Filesystem-backed question and interjection queue.
#[derive(Clone)]
pub struct HumanQueue {
    questions_dir: PathBuf,
    interjections_dir: PathBuf,
    poll_interval: Duration,
    handlers: Arc<Mutex<Handlers>>,
}

impl HumanQueue {
    /// Open (creating if necessary) `.questions/` and `.interjections/`
    /// under `base_dir`.
    pub async fn open(base_dir: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, QueueError> {
        let questions_dir = base_dir.as_ref().join(".questions");
        let interjections_dir = base_dir.as_ref().join(".interjections");
        tokio::fs::create_dir_all(&questions_dir).await?;
        tokio::fs::create_dir_all(&interjections_dir).await?;
        Ok(Self {
            questions_dir,
            interjections_dir,
            poll_interval,
            handlers: Arc::new(Mutex::new(Handlers {
                next_id: 0,
                entries: Vec::new(),
                poller: None,
            })),
        })
    }

    /// File a new pending question. Returns its generated id.
    #[instrument(skip(self, text))]
    pub async fn ask_question(
        &self,
        agent_name: &str,
        text: &str,
        task_id: Option<String>,
        choices: Option<Vec<String>>,
    ) -> Result<String, QueueError> {
        let id = gen_id("q");
        let question = Question::new(id.clone(), agent_name.to_string(), text.to_string(), task_id, choices, Utc::now());
        write_record(&self.questions_dir, &id, &question).await?;
        Ok(id)
    }

    /// Mark a question answered. Returns `false` if the record doesn't
    /// exist (already deleted, or never existed).
    #[instrument(skip(self, answer))]
    pub async fn answer_question(&self, id: &str, answer: &str) -> Result<bool, QueueError> {
        let mut question: Question = match read_record(&self.questions_dir, id).await? {
            Some(q) => q,
            None => return Ok(false),
        };
        question.status = QuestionStatus::Answered;
        question.answer = Some(answer.to_string());
        question.answered_at = Some(Utc::now());
        write_record(&self.questions_dir, id, &question).await?;
        Ok(true)
    }

    /// Look up a single question by id.
    pub async fn get_question(&self, id: &str) -> Result<Option<Question>, QueueError> {
        read_record(&self.questions_dir, id).await
    }

    /// All questions, optionally filtered by status, sorted ascending
    /// by `createdAt`.
    pub async fn list_questions(&self, status: Option<QuestionStatus>) -> Result<Vec<Question>, QueueError> {
        let mut all: Vec<Question> = list_records(&self.questions_dir)
            .await?
            .into_iter()
            .map(|(_, q)| q)
            .filter(|q| status.map(|s| q.status == s).unwrap_or(true))
            .collect();
        all.sort_by_key(|q| q.created_at);
        Ok(all)
    }

    /// Delete a question record. Returns `false` if it didn't exist.
    pub async fn delete_question(&self, id: &str) -> Result<bool, QueueError> {
        delete_record(&self.questions_dir, id).await
    }

    /// Delete every answered question. Returns the number removed.
    pub async fn clear_answered(&self) -> Result<usize, QueueError> {
        let answered = self.list_questions(Some(QuestionStatus::Answered)).await?;
        let mut count = 0;
        for q in answered {
            if self.delete_question(&q.id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// File a new pending interjection. Returns its generated id.
    #[instrument(skip(self, reason))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_interjection(
        &self,
        agent_name: &str,
        task_id: Option<String>,
        session_id: Option<String>,
        working_directory: &str,
        reason: Option<String>,
    ) -> Result<String, QueueError> {
        let id = gen_id("i");
        let interjection = Interjection::new(
            id.clone(),
            agent_name.to_string(),
            task_id,
            session_id,
            working_directory.to_string(),
            reason,
            Utc::now(),
        );
        write_record(&self.interjections_dir, &id, &interjection).await?;
        Ok(id)
    }

    /// Look up a single interjection by id.
    pub async fn get_interjection(&self, id: &str) -> Result<Option<Interjection>, QueueError> {
        read_record(&self.interjections_dir, id).await
    }

    /// All interjections, optionally filtered by status.
    pub async fn list_interjections(
        &self,
        status: Option<InterjectionStatus>,
    ) -> Result<Vec<Interjection>, QueueError> {
        let mut all: Vec<Interjection> = list_records(&self.interjections_dir)
            .await?
            .into_iter()
            .map(|(_, i)| i)
            .filter(|i| status.map(|s| i.status == s).unwrap_or(true))
            .collect();
        all.sort_by_key(|i| i.created_at);
        Ok(all)
    }

    /// Mark an interjection resumed. Returns `false` if the record
    /// doesn't exist.
    pub async fn mark_interjection_resumed(&self, id: &str) -> Result<bool, QueueError> {
        let mut interjection: Interjection = match read_record(&self.interjections_dir, id).await? {
            Some(i) => i,
            None => return Ok(false),
        };
        interjection.status = InterjectionStatus::Resumed;
        interjection.resumed_at = Some(Utc::now());
        write_record(&self.interjections_dir, id, &interjection).await?;
        Ok(true)
    }

    /// Mark an interjection dismissed. Returns `false` if the record
    /// doesn't exist.
    pub async fn dismiss_interjection(&self, id: &str) -> Result<bool, QueueError> {
        let mut interjection: Interjection = match read_record(&self.interjections_dir, id).await? {
            Some(i) => i,
            None => return Ok(false),
        };
        interjection.status = InterjectionStatus::Dismissed;
        write_record(&self.interjections_dir, id, &interjection).await?;
        Ok(true)
    }

    /// Register a handler for queue events. The directory watcher
    /// (a polling loop) starts on the first subscriber and stops when
    /// the last subscriber unregisters.
    pub async fn watch<F>(&self, handler: F) -> WatchHandle
    where
        F: Fn(QueueEvent) + Send + Sync + 'static,
    {
        let mut guard = self.handlers.lock().await;
        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.push((id, Arc::new(handler)));

        if guard.poller.is_none() {
            debug!("starting human queue poller");
            let handlers = self.handlers.clone();
            let questions_dir = self.questions_dir.clone();
            let interjections_dir = self.interjections_dir.clone();
            let interval = self.poll_interval;
            guard.poller = Some(tokio::spawn(poll_loop(
                handlers,
                questions_dir,
                interjections_dir,
                interval,
            )));
        }
        WatchHandle(id)
    }

    /// Unregister a handler previously returned by [`HumanQueue::watch`].
    pub async fn unwatch(&self, handle: WatchHandle) {
        let mut guard = self.handlers.lock().await;
        guard.entries.retain(|(id, _)| *id != handle.0);
        if guard.entries.is_empty() {
            if let Some(poller) = guard.poller.take() {
                debug!("stopping human queue poller: no subscribers remain");
                poller.abort();
            }
        }
    }

    /// Wait for a question to be answered. Returns immediately if it
    /// is already answered; otherwise subscribes and waits for
    /// `question_answered` (returns the answer), `question_deleted`
    /// (returns `None`), or the timeout (returns `None`). Always
    /// unsubscribes before returning.
    pub async fn wait_for_answer(&self, id: &str, timeout: Duration) -> Option<String> {
        if let Ok(Some(q)) = self.get_question(id).await {
            if q.status == QuestionStatus::Answered {
                return q.answer;
            }
        }

        let target = id.to_string();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Option<String>>(1);
        let tx = Arc::new(tx);
        let handle = self
            .watch(move |event| match event {
                QueueEvent::QuestionAnswered { id, record } if id == target => {
                    let _ = tx.try_send(record.answer);
                }
                QueueEvent::QuestionDeleted { id } if id == target => {
                    let _ = tx.try_send(None);
                }
                _ => {}
            })
            .await;

        let result = tokio::time::timeout(timeout, rx.recv()).await;
        self.unwatch(handle).await;

        match result {
            Ok(Some(answer)) => answer,
            Ok(None) | Err(_) => None,
        }
    }
}

fn gen_id(prefix: &str) -> String {
    let ms = Utc::now().timestamp_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{prefix}-{ms}-{suffix}")
}

async fn write_record<T: Serialize>(dir: &Path, id: &str, record: &T) -> Result<(), QueueError> {
    let body = serde_json::to_vec_pretty(record)?;
    let final_path = dir.join(format!("{id}.json"));
    let tmp_suffix: u64 = rand::random();
    let tmp_path = dir.join(format!(".{id}.tmp{tmp_suffix:x}"));
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

async fn read_record<T: DeserializeOwned>(dir: &Path, id: &str) -> Result<Option<T>, QueueError> {
    let path = dir.join(format!("{id}.json"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_record(dir: &Path, id: &str) -> Result<bool, QueueError> {
    match tokio::fs::remove_file(dir.join(format!("{id}.json"))).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// List every well-formed record in `dir`. Files that fail to parse
/// are skipped rather than failing the whole scan — a rename-in-flight
/// can transiently present a truncated file, and the next scan (or
/// direct lookup) will see it correctly.
async fn list_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(String, T)>, QueueError> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(record) => out.push((stem.to_string(), record)),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unparsable record this scan"),
            },
            Err(_) => continue,
        }
    }
    Ok(out)
}

async fn dispatch(handlers: &Arc<Mutex<Handlers>>, event: QueueEvent) {
    let snapshot: Vec<Handler> = {
        let guard = handlers.lock().await;
        guard.entries.iter().map(|(_, h)| h.clone()).collect()
    };
    for handler in snapshot {
        handler(event.clone());
    }
}

async fn poll_loop(
    handlers: Arc<Mutex<Handlers>>,
    questions_dir: PathBuf,
    interjections_dir: PathBuf,
    interval: Duration,
) {
    let mut known_q: HashMap<String, QuestionStatus> = HashMap::new();
    let mut known_i: HashMap<String, InterjectionStatus> = HashMap::new();
    let mut primed = false;

    loop {
        let questions = match list_records::<Question>(&questions_dir).await {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "question directory scan failed, retrying next tick");
                Vec::new()
            }
        };
        let interjections = match list_records::<Interjection>(&interjections_dir).await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "interjection directory scan failed, retrying next tick");
                Vec::new()
            }
        };

        let q_now: HashMap<String, Question> = questions.into_iter().collect();
        let i_now: HashMap<String, Interjection> = interjections.into_iter().collect();

        if primed {
            for (id, q) in &q_now {
                match known_q.get(id) {
                    None => dispatch(&handlers, QueueEvent::QuestionAdded { id: id.clone(), record: q.clone() }).await,
                    Some(prev) if *prev != q.status && q.status == QuestionStatus::Answered => {
                        dispatch(&handlers, QueueEvent::QuestionAnswered { id: id.clone(), record: q.clone() }).await;
                    }
                    _ => {}
                }
            }
            for id in known_q.keys() {
                if !q_now.contains_key(id) {
                    dispatch(&handlers, QueueEvent::QuestionDeleted { id: id.clone() }).await;
                }
            }

            for (id, i) in &i_now {
                match known_i.get(id) {
                    None => dispatch(&handlers, QueueEvent::InterjectionAdded { id: id.clone(), record: i.clone() }).await,
                    Some(prev) if *prev != i.status && i.status == InterjectionStatus::Resumed => {
                        dispatch(&handlers, QueueEvent::InterjectionResumed { id: id.clone(), record: i.clone() }).await;
                    }
                    Some(prev) if *prev != i.status && i.status == InterjectionStatus::Dismissed => {
                        dispatch(&handlers, QueueEvent::InterjectionDismissed { id: id.clone(), record: i.clone() }).await;
                    }
                    _ => {}
                }
            }
            for id in known_i.keys() {
                if !i_now.contains_key(id) {
                    dispatch(&handlers, QueueEvent::InterjectionDeleted { id: id.clone() }).await;
                }
            }
        }

        known_q = q_now.iter().map(|(id, q)| (id.clone(), q.status)).collect();
        known_i = i_now.iter().map(|(id, i)| (id.clone(), i.status)).collect();
        primed = true;

        tokio::time::sleep(interval).await;
    }
}
