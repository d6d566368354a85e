//! Server-side sessions carried by a cookie.
//!
//! A `Session` is extracted per request and handed to the handler, which asks
//! it whether the administrator is logged in, queues flash messages and
//! finally lets it stamp the response with a cookie when needed.

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::security::{new_session_token, token_fingerprint};

pub const SESSION_COOKIE: &str = "stage_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashLevel {
    Info,
    Error,
}

impl FlashLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flash {
    pub level: FlashLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    authenticated: bool,
    flashes: Vec<Flash>,
    last_seen: DateTime<Utc>,
}

impl SessionEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            authenticated: false,
            flashes: Vec::new(),
            last_seen: now,
        }
    }
}

/// Expired entries are swept at most this often.
const SWEEP_INTERVAL_SECS: i64 = 60;
/// Upper bound on stored sessions. Beyond it the least recently seen entry is
/// evicted, anonymous ones first.
pub const MAX_SESSIONS: usize = 4096;

#[derive(Debug)]
struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    last_sweep: DateTime<Utc>,
}

impl SessionTable {
    fn sweep(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.entries.retain(|_, entry| now - entry.last_seen <= ttl);
        self.last_sweep = now;
    }

    fn sweep_if_due(&mut self, now: DateTime<Utc>, ttl: Duration) {
        if now - self.last_sweep >= Duration::seconds(SWEEP_INTERVAL_SECS) {
            self.sweep(now, ttl);
        }
    }

    /// Marks a live entry as seen. An expired entry is dropped and reported
    /// as missing.
    fn touch(&mut self, fingerprint: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        let expired = match self.entries.get_mut(fingerprint) {
            None => return false,
            Some(entry) if now - entry.last_seen > ttl => true,
            Some(entry) => {
                entry.last_seen = now;
                false
            }
        };
        if expired {
            self.entries.remove(fingerprint);
        }
        !expired
    }

    fn insert(&mut self, fingerprint: String, entry: SessionEntry, ttl: Duration) {
        if self.entries.len() >= MAX_SESSIONS {
            self.sweep(entry.last_seen, ttl);
        }
        if self.entries.len() >= MAX_SESSIONS {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.authenticated, entry.last_seen))
                .map(|(fingerprint, _)| fingerprint.clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(fingerprint, entry);
    }
}

/// Live sessions, keyed by token fingerprint. Visitors that never log in or
/// receive a flash message are not stored at all.
#[derive(Debug)]
pub struct SessionStore {
    table: Mutex<SessionTable>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Mutex::new(SessionTable {
                entries: HashMap::new(),
                last_sweep: Utc::now(),
            }),
            ttl,
        }
    }

    /// Looks up the session named by the request cookie. An absent, unknown
    /// or expired cookie yields an anonymous session with nothing stored yet.
    pub fn resolve(self: &Arc<Self>, headers: &HeaderMap) -> Session {
        self.resolve_at(headers, Utc::now())
    }

    fn resolve_at(self: &Arc<Self>, headers: &HeaderMap, now: DateTime<Utc>) -> Session {
        let mut table = self.table.lock();
        table.sweep_if_due(now, self.ttl);
        let token = session_cookie(headers)
            .filter(|token| table.touch(&token_fingerprint(token), now, self.ttl));
        Session {
            store: Arc::clone(self),
            token,
            issue_cookie: false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }
}

/// Per-request handle on a server-side session.
#[derive(Debug)]
pub struct Session {
    store: Arc<SessionStore>,
    token: Option<String>,
    issue_cookie: bool,
}

impl Session {
    fn read_entry<R>(&self, f: impl FnOnce(&mut SessionEntry) -> R) -> Option<R> {
        let token = self.token.as_ref()?;
        let mut table = self.store.table.lock();
        table.entries.get_mut(&token_fingerprint(token)).map(f)
    }

    /// Runs `f` on the stored entry, creating it under a new token first when
    /// this visitor has none yet.
    fn write_entry<R>(&mut self, f: impl FnOnce(&mut SessionEntry) -> R) -> R {
        let now = Utc::now();
        let mut table = self.store.table.lock();
        if let Some(token) = &self.token
            && let Some(entry) = table.entries.get_mut(&token_fingerprint(token))
        {
            entry.last_seen = now;
            return f(entry);
        }

        let mut entry = SessionEntry::new(now);
        let result = f(&mut entry);
        let token = new_session_token();
        table.insert(token_fingerprint(&token), entry, self.store.ttl);
        self.token = Some(token);
        self.issue_cookie = true;
        result
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_entry(|entry| entry.authenticated).unwrap_or(false)
    }

    /// Marks the session as the administrator's. The token is rotated so a
    /// cookie planted before login is worthless afterwards.
    pub fn log_in(&mut self) {
        let now = Utc::now();
        let mut table = self.store.table.lock();
        let previous = self
            .token
            .take()
            .and_then(|token| table.entries.remove(&token_fingerprint(&token)));
        let mut entry = SessionEntry::new(now);
        entry.authenticated = true;
        if let Some(previous) = previous {
            entry.flashes = previous.flashes;
        }
        let token = new_session_token();
        table.insert(token_fingerprint(&token), entry, self.store.ttl);
        self.token = Some(token);
        self.issue_cookie = true;
    }

    /// Forgets the session entirely. A later flash starts a new anonymous one.
    pub fn log_out(&mut self) {
        if let Some(token) = self.token.take() {
            self.store
                .table
                .lock()
                .entries
                .remove(&token_fingerprint(&token));
        }
        self.issue_cookie = false;
    }

    pub fn flash(&mut self, level: FlashLevel, message: impl Into<String>) {
        let message = message.into();
        self.write_entry(|entry| entry.flashes.push(Flash { level, message }));
    }

    /// Pending messages, removed from the session once read.
    pub fn take_flashes(&self) -> Vec<Flash> {
        self.read_entry(|entry| std::mem::take(&mut entry.flashes)).unwrap_or_default()
    }

    /// Attaches the session cookie to `response` when the browser does not
    /// have the current token yet.
    pub fn finish(self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if self.issue_cookie
            && let Some(token) = &self.token
        {
            let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(err) => tracing::warn!(error = %err, "could not encode session cookie"),
            }
        }
        response
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
    Arc<SessionStore>: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let store = Arc::<SessionStore>::from_ref(state);
        Ok(store.resolve(&parts.headers))
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
