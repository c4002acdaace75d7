//! The glyph record and its closed vocabularies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The fixed tag set for glyph records.
///
/// The first seven are core tags (lowercase in the external CLI); the
/// remaining six are task-centric (uppercase externally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlyphType {
    Decision,
    Question,
    Fact,
    Action,
    Note,
    Conversation,
    Idea,
    Todo,
    Goal,
    Attempt,
    Result,
    Lesson,
    Phase,
}

impl GlyphType {
    /// All tags, in canonical order.
    pub const ALL: [GlyphType; 13] = [
        Self::Decision,
        Self::Question,
        Self::Fact,
        Self::Action,
        Self::Note,
        Self::Conversation,
        Self::Idea,
        Self::Todo,
        Self::Goal,
        Self::Attempt,
        Self::Result,
        Self::Lesson,
        Self::Phase,
    ];

    /// Canonical storage form (always lowercase).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Question => "question",
            Self::Fact => "fact",
            Self::Action => "action",
            Self::Note => "note",
            Self::Conversation => "conversation",
            Self::Idea => "idea",
            Self::Todo => "todo",
            Self::Goal => "goal",
            Self::Attempt => "attempt",
            Self::Result => "result",
            Self::Lesson => "lesson",
            Self::Phase => "phase",
        }
    }

    /// External display form: task-centric tags render uppercase.
    pub fn external(&self) -> String {
        if self.is_task_centric() {
            self.as_str().to_uppercase()
        } else {
            self.as_str().to_string()
        }
    }

    /// Single-letter label used in rendered lines.
    pub fn letter(&self) -> char {
        match self {
            Self::Decision => 'D',
            Self::Question => 'Q',
            Self::Fact => 'F',
            Self::Action => 'A',
            Self::Note => 'N',
            Self::Conversation => 'C',
            Self::Idea => 'I',
            Self::Todo => 'T',
            Self::Goal => 'G',
            Self::Attempt => 'a',
            Self::Result => 'R',
            Self::Lesson => 'L',
            Self::Phase => 'P',
        }
    }

    pub fn is_task_centric(&self) -> bool {
        matches!(
            self,
            Self::Todo | Self::Goal | Self::Attempt | Self::Result | Self::Lesson | Self::Phase
        )
    }
}

impl std::fmt::Display for GlyphType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GlyphType {
    type Err = Error;

    /// Accepts canonical names in either case plus the single-letter
    /// shorthand used by the `write_memory` action.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "decision" | "d" => Ok(Self::Decision),
            "question" | "q" => Ok(Self::Question),
            "fact" | "f" => Ok(Self::Fact),
            "action" | "a" => Ok(Self::Action),
            "note" | "n" => Ok(Self::Note),
            "conversation" | "c" => Ok(Self::Conversation),
            "idea" | "i" => Ok(Self::Idea),
            "todo" | "t" => Ok(Self::Todo),
            "goal" | "g" => Ok(Self::Goal),
            "attempt" => Ok(Self::Attempt),
            "result" | "r" => Ok(Self::Result),
            "lesson" | "l" => Ok(Self::Lesson),
            "phase" | "p" => Ok(Self::Phase),
            other => Err(Error::validation(format!("unknown glyph type '{}'", other))),
        }
    }
}

/// Lifecycle of the glyph itself within the store.
///
/// The only mutable bit of a glyph, and it is monotonic: `active` may move
/// to any non-active state, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlyphStatus {
    #[default]
    Active,
    Superseded,
    Deprecated,
    Duplicate,
}

impl GlyphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Deprecated => "deprecated",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for GlyphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GlyphStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            "deprecated" => Ok(Self::Deprecated),
            "duplicate" => Ok(Self::Duplicate),
            other => Err(Error::validation(format!("unknown glyph status '{}'", other))),
        }
    }
}

/// Authoritative status of a `todo`/`goal` task, carried in `choice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Sort band for task listings: BLOCKED < IN_PROGRESS < OPEN < DONE.
    pub fn band(&self) -> u8 {
        match self {
            Self::Blocked => 0,
            Self::InProgress => 1,
            Self::Open => 2,
            Self::Done => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(Error::validation(format!("unknown task status '{}'", other))),
        }
    }
}

/// Multi-tenant scope of a glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Shared,
    Chat,
    Agent,
    Team,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Chat => "chat",
            Self::Agent => "agent",
            Self::Team => "team",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(Self::Shared),
            "chat" => Ok(Self::Chat),
            "agent" => Ok(Self::Agent),
            "team" => Ok(Self::Team),
            other => Err(Error::validation(format!("unknown scope '{}'", other))),
        }
    }
}

/// Visibility of a glyph within its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
    Internal,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            "internal" => Ok(Self::Internal),
            other => Err(Error::validation(format!("unknown visibility '{}'", other))),
        }
    }
}

/// Importance tag with retrieval-boost semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Importance {
    H,
    M,
    L,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H => "H",
            Self::M => "M",
            Self::L => "L",
        }
    }

    /// Primary sort rank when `importance` drives ordering (H < M < L).
    pub fn rank(&self) -> u8 {
        match self {
            Self::H => 0,
            Self::M => 1,
            Self::L => 2,
        }
    }

    /// Multiplier applied during hybrid semantic ranking.
    pub fn boost(&self) -> f64 {
        match self {
            Self::H => 1.3,
            Self::M => 1.1,
            Self::L => 1.0,
        }
    }

    /// Boost for glyphs carrying no importance tag.
    pub const NONE_BOOST: f64 = 0.9;
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Importance {
    type Err = Error;

    /// Accepts the short form and the long priority aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "h" | "high" | "critical" => Ok(Self::H),
            "m" | "medium" | "moderate" => Ok(Self::M),
            "l" | "low" | "minor" => Ok(Self::L),
            other => Err(Error::validation(format!("unknown importance '{}'", other))),
        }
    }
}

/// One typed record in the store; the atomic unit of memory.
///
/// Glyphs are append-only: textual correction happens by emitting a new
/// glyph and marking the prior one superseded. The only in-place mutations
/// the store performs are the status flip (with cross-refs) and late
/// embedding population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Glyph {
    /// Monotonically assigned by the store; 0 until appended.
    pub id: i64,
    #[serde(rename = "type")]
    pub glyph_type: GlyphType,
    pub topic: Option<String>,
    pub text: String,
    /// Contextual: decision option, task status, result outcome,
    /// phase transition label, or conversation speaker.
    pub choice: Option<String>,
    pub rationale: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub scope: Scope,
    pub chat_id: Option<String>,
    pub agent_role: Option<String>,
    pub visibility: Visibility,
    pub project: Option<String>,
    pub importance: Option<Importance>,
    pub due: Option<String>,
    /// Structured payload: `{"id": task_id}` for tasks,
    /// `{"from","to","round","error"}` for phases.
    pub links: Option<Value>,
    pub task_id: Option<String>,
    pub metric: Option<String>,
    pub session: Option<String>,
    pub source: Option<String>,
    pub status: GlyphStatus,
    pub superseded_by: Option<i64>,
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
}

impl Glyph {
    /// Create a new glyph with the required fields; everything else defaults.
    pub fn new(glyph_type: GlyphType, text: impl Into<String>) -> Self {
        Self {
            id: 0,
            glyph_type,
            topic: None,
            text: text.into(),
            choice: None,
            rationale: None,
            timestamp: Utc::now(),
            scope: Scope::default(),
            chat_id: None,
            agent_role: None,
            visibility: Visibility::default(),
            project: None,
            importance: None,
            due: None,
            links: None,
            task_id: None,
            metric: None,
            session: None,
            source: None,
            status: GlyphStatus::default(),
            superseded_by: None,
            superseded_at: None,
            embedding: None,
            embedding_model: None,
            embedding_dim: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_choice(mut self, choice: impl Into<String>) -> Self {
        self.choice = Some(choice.into());
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_agent_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_due(mut self, due: impl Into<String>) -> Self {
        self.due = Some(due.into());
        self
    }

    pub fn with_links(mut self, links: Value) -> Self {
        self.links = Some(links);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>, model: impl Into<String>) -> Self {
        self.embedding_dim = Some(embedding.len());
        self.embedding = Some(embedding);
        self.embedding_model = Some(model.into());
        self
    }

    /// Task status parsed from `choice`, for todo/goal glyphs.
    pub fn task_status(&self) -> Option<TaskStatus> {
        if !matches!(self.glyph_type, GlyphType::Todo | GlyphType::Goal) {
            return None;
        }
        self.choice.as_deref().and_then(|c| c.parse().ok())
    }

    /// Whether the stored embedding satisfies the dim invariant.
    pub fn embedding_consistent(&self) -> bool {
        match (&self.embedding, self.embedding_dim) {
            (Some(v), Some(dim)) => v.len() == dim,
            (None, None) => true,
            _ => false,
        }
    }
}

/// Validate the external task identifier grammar: `[a-z0-9\-]+`.
pub fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty()
        || !task_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(Error::validation(format!(
            "invalid task id '{}': expected [a-z0-9-]+",
            task_id
        )));
    }
    Ok(())
}
