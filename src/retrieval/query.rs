//! Filtered glyph queries and prompt-ready rendering.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::store::{
    row_to_glyph, Glyph, GlyphStore, GlyphType, Importance, Scope, Visibility, GLYPH_COLUMNS,
};

/// Caller identity used for scope/visibility filtering.
///
/// Visibility is a query-time composition of disjunctive filter groups, not
/// per-caller copies of the store. `Caller::operator()` bypasses filtering
/// entirely (operator CLI and maintenance jobs).
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub chat_id: Option<String>,
    pub role: Option<String>,
    pub session: Option<String>,
    unrestricted: bool,
}

impl Caller {
    pub fn new() -> Self {
        Self::default()
    }

    /// An operator caller that sees every glyph.
    pub fn operator() -> Self {
        Self {
            unrestricted: true,
            ..Self::default()
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    /// Whether this caller may see the given glyph under the §6.1 rules.
    pub fn can_see(&self, glyph: &Glyph) -> bool {
        if self.unrestricted {
            return true;
        }

        // private: writer-only scratch, matched by session
        if glyph.visibility == Visibility::Private {
            return self.session.is_some() && self.session == glyph.session;
        }

        // shared + public: everyone
        if glyph.scope == Scope::Shared && glyph.visibility == Visibility::Public {
            return true;
        }

        // chat scope: session binding via chat_id
        if glyph.scope == Scope::Chat && glyph.chat_id.is_some() {
            return self.chat_id == glyph.chat_id;
        }

        // role-tagged glyphs
        if let Some(role) = &glyph.agent_role {
            if Some(role) != self.role.as_ref() {
                return false;
            }
            return match glyph.visibility {
                Visibility::Public => true,
                Visibility::Internal => self.chat_id.is_some() && self.chat_id == glyph.chat_id,
                Visibility::Private => unreachable!("handled above"),
            };
        }

        false
    }
}

/// Parsed `recent=<N><h|d|w|m>` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentWindow {
    pub count: u64,
    pub unit: char,
}

impl RecentWindow {
    pub fn parse(raw: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| Regex::new(r"^(\d+)([hdwm])$").unwrap());

        let caps = pattern
            .captures(raw)
            .ok_or_else(|| Error::validation(format!("bad recent filter '{}': expected <N><h|d|w|m>", raw)))?;
        Ok(Self {
            count: caps[1].parse().map_err(|_| {
                Error::validation(format!("bad recent count in '{}'", raw))
            })?,
            unit: caps[2].chars().next().unwrap(),
        })
    }

    pub fn duration(&self) -> Duration {
        let hours = match self.unit {
            'h' => self.count,
            'd' => self.count * 24,
            'w' => self.count * 24 * 7,
            'm' => self.count * 24 * 30,
            _ => unreachable!("validated by parse"),
        };
        Duration::hours(hours as i64)
    }
}

/// Structured filter set for glyph queries. Filters combine with AND.
#[derive(Debug, Clone, Default)]
pub struct GlyphQuery {
    pub glyph_type: Option<GlyphType>,
    pub topic: Option<String>,
    pub text_contains: Option<String>,
    pub session: Option<String>,
    pub source: Option<String>,
    pub choice: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub scope: Option<Scope>,
    pub chat_id: Option<String>,
    pub role: Option<String>,
    pub visibility: Option<Visibility>,
    pub project: Option<String>,
    pub task_id: Option<String>,
    pub importance: Option<Importance>,
    pub recent: Option<RecentWindow>,
    /// Include superseded/deprecated/duplicate rows (default: active only).
    pub include_non_active: bool,
    pub limit: usize,
}

impl GlyphQuery {
    pub fn new() -> Self {
        Self {
            limit: 50,
            ..Self::default()
        }
    }

    pub fn glyph_type(mut self, ty: GlyphType) -> Self {
        self.glyph_type = Some(ty);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn text_contains(mut self, needle: impl Into<String>) -> Self {
        self.text_contains = Some(needle.into());
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn choice(mut self, choice: impl Into<String>) -> Self {
        self.choice = Some(choice.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn recent(mut self, raw: &str) -> Result<Self> {
        self.recent = Some(RecentWindow::parse(raw)?);
        Ok(self)
    }

    pub fn include_non_active(mut self) -> Self {
        self.include_non_active = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Parse a `key=value` filter pair as accepted by the CLI and the
    /// `write_memory` action. Unknown keys are rejected.
    pub fn apply_pair(mut self, key: &str, value: &str) -> Result<Self> {
        match key {
            "type" => self.glyph_type = Some(value.parse()?),
            "topic" => self.topic = Some(value.to_string()),
            "text" => self.text_contains = Some(value.to_string()),
            "session" => self.session = Some(value.to_string()),
            "source" => self.source = Some(value.to_string()),
            "choice" | "status" => self.choice = Some(value.to_string()),
            "since" => {
                self.since = Some(parse_time_filter(value)?);
            }
            "until" => {
                self.until = Some(parse_time_filter(value)?);
            }
            "scope" => self.scope = Some(value.parse()?),
            "chat_id" => self.chat_id = Some(value.to_string()),
            "role" => self.role = Some(value.to_string()),
            "visibility" => self.visibility = Some(value.parse()?),
            "project" => self.project = Some(value.to_string()),
            "task_id" => self.task_id = Some(value.to_string()),
            "importance" => self.importance = Some(value.parse()?),
            "recent" => self.recent = Some(RecentWindow::parse(value)?),
            other => {
                return Err(Error::validation(format!("unknown filter key '{}'", other)));
            }
        }
        Ok(self)
    }
}

fn parse_time_filter(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::validation(format!("bad timestamp '{}': {}", value, e)))
}

impl GlyphStore {
    /// Run a filtered query. Results are ordered by `timestamp DESC, id
    /// DESC`, or importance-first when the importance filter is present.
    /// Scope/visibility rules apply per the caller identity.
    pub fn query(&self, query: &GlyphQuery, caller: &Caller) -> Result<Vec<Glyph>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        if let Some(recent) = &query.recent {
            if recent.count == 0 {
                return Ok(Vec::new());
            }
        }

        let mut sql = format!("SELECT {} FROM glyphs WHERE 1=1", GLYPH_COLUMNS);
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !query.include_non_active {
            sql.push_str(" AND status = 'active'");
        }
        if let Some(ty) = query.glyph_type {
            sql.push_str(" AND glyph_type = ?");
            binds.push(Box::new(ty.as_str().to_string()));
        }
        if let Some(topic) = &query.topic {
            sql.push_str(" AND topic = ?");
            binds.push(Box::new(topic.clone()));
        }
        if let Some(needle) = &query.text_contains {
            sql.push_str(" AND text LIKE ?");
            binds.push(Box::new(format!("%{}%", needle)));
        }
        if let Some(session) = &query.session {
            sql.push_str(" AND session = ?");
            binds.push(Box::new(session.clone()));
        }
        if let Some(source) = &query.source {
            sql.push_str(" AND source = ?");
            binds.push(Box::new(source.clone()));
        }
        if let Some(choice) = &query.choice {
            sql.push_str(" AND choice = ?");
            binds.push(Box::new(choice.clone()));
        }
        if let Some(since) = &query.since {
            sql.push_str(" AND timestamp >= ?");
            binds.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = &query.until {
            sql.push_str(" AND timestamp <= ?");
            binds.push(Box::new(until.to_rfc3339()));
        }
        if let Some(scope) = query.scope {
            sql.push_str(" AND scope = ?");
            binds.push(Box::new(scope.as_str().to_string()));
        }
        if let Some(chat_id) = &query.chat_id {
            sql.push_str(" AND chat_id = ?");
            binds.push(Box::new(chat_id.clone()));
        }
        if let Some(role) = &query.role {
            sql.push_str(" AND agent_role = ?");
            binds.push(Box::new(role.clone()));
        }
        if let Some(visibility) = query.visibility {
            sql.push_str(" AND visibility = ?");
            binds.push(Box::new(visibility.as_str().to_string()));
        }
        if let Some(project) = &query.project {
            sql.push_str(" AND project = ?");
            binds.push(Box::new(project.clone()));
        }
        if let Some(task_id) = &query.task_id {
            sql.push_str(" AND task_id = ?");
            binds.push(Box::new(task_id.clone()));
        }
        if let Some(importance) = query.importance {
            sql.push_str(" AND importance = ?");
            binds.push(Box::new(importance.as_str().to_string()));
        }
        if let Some(recent) = &query.recent {
            sql.push_str(" AND timestamp >= ?");
            binds.push(Box::new((Utc::now() - recent.duration()).to_rfc3339()));
        }

        if query.importance.is_some() {
            sql.push_str(
                " ORDER BY CASE importance WHEN 'H' THEN 0 WHEN 'M' THEN 1 WHEN 'L' THEN 2 \
                 ELSE 3 END ASC, timestamp DESC, id DESC",
            );
        } else {
            sql.push_str(" ORDER BY timestamp DESC, id DESC");
        }

        // Visibility filtering happens in Rust over a wider window, so
        // over-fetch before applying the caller predicate.
        let fetch_limit = if caller.is_unrestricted() {
            query.limit
        } else {
            query.limit.saturating_mul(4).max(64)
        }
        .min(i64::MAX as usize);
        sql.push_str(&format!(" LIMIT {}", fetch_limit));

        let rows: Vec<Glyph> = self.with_conn(|conn| {
            let bind_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let glyphs = stmt
                .query_map(bind_refs.as_slice(), row_to_glyph)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(glyphs)
        })?;

        Ok(rows
            .into_iter()
            .filter(|g| caller.can_see(g))
            .take(query.limit)
            .collect())
    }

    /// Same selection as `query`, rendered as compact single-line glyph
    /// format for prompt injection.
    pub fn render(&self, query: &GlyphQuery, caller: &Caller) -> Result<Vec<String>> {
        let glyphs = self.query(query, caller)?;
        let now = Utc::now();
        Ok(glyphs.iter().map(|g| render_glyph(g, now)).collect())
    }
}

/// One-line render: `[T][topic=X][ts=rel][attrs] content`.
pub fn render_glyph(glyph: &Glyph, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(glyph.timestamp);
    let mut line = format!("[{}]", glyph.glyph_type.letter());

    if let Some(topic) = &glyph.topic {
        line.push_str(&format!("[topic={}]", topic));
    }
    line.push_str(&format!("[ts={}]", relative_age(age)));
    if age < Duration::hours(1) {
        line.push_str("[FRESH]");
    }
    if let Some(choice) = &glyph.choice {
        line.push_str(&format!("[choice={}]", choice));
    }
    if let Some(importance) = glyph.importance {
        line.push_str(&format!("[imp={}]", importance));
    }
    if let Some(task_id) = &glyph.task_id {
        line.push_str(&format!("[task={}]", task_id));
    }

    line.push(' ');
    line.push_str(&glyph.text);
    line
}

/// Render a duration as a compact relative age (`5m ago`, `3h ago`).
pub fn relative_age(age: Duration) -> String {
    let seconds = age.num_seconds().max(0);
    if seconds < 60 {
        format!("{}s ago", seconds)
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with(glyphs: Vec<Glyph>) -> GlyphStore {
        let store = GlyphStore::in_memory().unwrap();
        for glyph in glyphs {
            store.append(&glyph).unwrap();
        }
        store
    }

    #[test]
    fn test_query_by_type_and_topic() {
        let store = store_with(vec![
            Glyph::new(GlyphType::Decision, "Use bearer tokens").with_topic("auth"),
            Glyph::new(GlyphType::Fact, "API uses JWT").with_topic("auth"),
            Glyph::new(GlyphType::Decision, "Use Postgres").with_topic("db"),
        ]);

        let results = store
            .query(
                &GlyphQuery::new()
                    .glyph_type(GlyphType::Decision)
                    .topic("auth"),
                &Caller::operator(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "Use bearer tokens");
    }

    #[test]
    fn test_query_newest_first_with_id_tiebreak() {
        let ts = Utc::now();
        let store = store_with(vec![
            Glyph::new(GlyphType::Fact, "older").with_timestamp(ts),
            Glyph::new(GlyphType::Fact, "newer").with_timestamp(ts),
        ]);

        let results = store
            .query(&GlyphQuery::new(), &Caller::operator())
            .unwrap();
        assert_eq!(results[0].text, "newer");
        assert_eq!(results[1].text, "older");
    }

    #[test]
    fn test_importance_primary_ordering() {
        let store = store_with(vec![
            Glyph::new(GlyphType::Fact, "low").with_importance(Importance::L),
            Glyph::new(GlyphType::Fact, "high").with_importance(Importance::H),
            Glyph::new(GlyphType::Fact, "high2").with_importance(Importance::H),
        ]);

        let results = store
            .query(
                &GlyphQuery::new().importance(Importance::H),
                &Caller::operator(),
            )
            .unwrap();
        assert_eq!(results.len(), 2);
        // Within the band, newest first
        assert_eq!(results[0].text, "high2");
    }

    #[test]
    fn test_limit_zero_is_empty() {
        let store = store_with(vec![Glyph::new(GlyphType::Fact, "x")]);
        let results = store
            .query(&GlyphQuery::new().limit(0), &Caller::operator())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_recent_zero_is_empty() {
        let store = store_with(vec![Glyph::new(GlyphType::Fact, "x")]);
        let query = GlyphQuery::new().recent("0h").unwrap();
        assert!(store.query(&query, &Caller::operator()).unwrap().is_empty());
    }

    #[test]
    fn test_recent_units() {
        assert_eq!(
            RecentWindow::parse("3h").unwrap().duration(),
            Duration::hours(3)
        );
        assert_eq!(
            RecentWindow::parse("2d").unwrap().duration(),
            Duration::hours(48)
        );
        assert_eq!(
            RecentWindow::parse("1w").unwrap().duration(),
            Duration::hours(24 * 7)
        );
        assert_eq!(
            RecentWindow::parse("1m").unwrap().duration(),
            Duration::hours(24 * 30)
        );
        assert!(RecentWindow::parse("5x").is_err());
        assert!(RecentWindow::parse("h").is_err());
    }

    #[test]
    fn test_unknown_filter_key_rejected() {
        let err = GlyphQuery::new().apply_pair("flavour", "sweet").unwrap_err();
        assert!(err.to_string().contains("unknown filter key"));
    }

    #[test]
    fn test_non_active_excluded_by_default() {
        let store = GlyphStore::in_memory().unwrap();
        let old = store.append(&Glyph::new(GlyphType::Fact, "v1")).unwrap();
        let new = store.append(&Glyph::new(GlyphType::Fact, "v2")).unwrap();
        store.supersede(old, new, "corrected").unwrap();

        let active = store
            .query(&GlyphQuery::new(), &Caller::operator())
            .unwrap();
        assert_eq!(active.len(), 1);

        let all = store
            .query(&GlyphQuery::new().include_non_active(), &Caller::operator())
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_shared_public_visible_to_all() {
        let glyph = Glyph::new(GlyphType::Fact, "x");
        assert!(Caller::new().can_see(&glyph));
        assert!(Caller::new().with_role("coder").can_see(&glyph));
    }

    #[test]
    fn test_chat_scope_requires_matching_chat() {
        let glyph = Glyph::new(GlyphType::Fact, "x")
            .with_scope(Scope::Chat)
            .with_chat_id("chat-1");
        assert!(Caller::new().with_chat_id("chat-1").can_see(&glyph));
        assert!(!Caller::new().with_chat_id("chat-2").can_see(&glyph));
        assert!(!Caller::new().can_see(&glyph));
    }

    #[test]
    fn test_role_visibility_rules() {
        let public_role = Glyph::new(GlyphType::Fact, "x")
            .with_scope(Scope::Agent)
            .with_agent_role("reviewer");
        assert!(Caller::new().with_role("reviewer").can_see(&public_role));
        assert!(!Caller::new().with_role("coder").can_see(&public_role));

        let internal = Glyph::new(GlyphType::Fact, "x")
            .with_scope(Scope::Agent)
            .with_agent_role("reviewer")
            .with_visibility(Visibility::Internal)
            .with_chat_id("chat-1");
        assert!(Caller::new()
            .with_role("reviewer")
            .with_chat_id("chat-1")
            .can_see(&internal));
        assert!(!Caller::new().with_role("reviewer").can_see(&internal));
    }

    #[test]
    fn test_private_writer_only() {
        let glyph = Glyph::new(GlyphType::Note, "scratch")
            .with_visibility(Visibility::Private)
            .with_session("sess-1");
        assert!(Caller::new().with_session("sess-1").can_see(&glyph));
        assert!(!Caller::new().with_session("sess-2").can_see(&glyph));
        assert!(Caller::operator().can_see(&glyph));
    }

    #[test]
    fn test_render_format() {
        let now = Utc::now();
        let glyph = Glyph::new(GlyphType::Decision, "Use bearer tokens")
            .with_topic("auth")
            .with_choice("bearer")
            .with_importance(Importance::H)
            .with_timestamp(now - Duration::minutes(5));

        let line = render_glyph(&glyph, now);
        assert!(line.starts_with("[D][topic=auth][ts=5m ago][FRESH][choice=bearer][imp=H] "));
        assert!(line.ends_with("Use bearer tokens"));
    }

    #[test]
    fn test_render_old_glyph_not_fresh() {
        let now = Utc::now();
        let glyph =
            Glyph::new(GlyphType::Fact, "x").with_timestamp(now - Duration::days(2));
        let line = render_glyph(&glyph, now);
        assert!(line.contains("[ts=2d ago]"));
        assert!(!line.contains("[FRESH]"));
    }

    proptest::proptest! {
        #[test]
        fn prop_recent_parse_round_trip(count in 0u64..10_000, unit in proptest::sample::select(vec!['h', 'd', 'w', 'm'])) {
            let raw = format!("{}{}", count, unit);
            let window = RecentWindow::parse(&raw).unwrap();
            proptest::prop_assert_eq!(window.count, count);
            proptest::prop_assert_eq!(window.unit, unit);
        }
    }
}
