// tenantbackup/src/server/auth.rs
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::{ApiToken, Role};

/// Caller resolved from a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub is_admin: bool,
}

/// Resolves bearer credentials. `None` means the credential is unknown.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, bearer: &str) -> Option<Principal>;
}

/// Authenticator over the tokens listed in `config.json`.
pub struct StaticTokenAuthenticator {
    tokens: Vec<ApiToken>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: Vec<ApiToken>) -> Self {
        StaticTokenAuthenticator { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, bearer: &str) -> Option<Principal> {
        self.tokens
            .iter()
            .find(|t| constant_time_eq(t.token.as_bytes(), bearer.as_bytes()))
            .map(|t| Principal {
                subject: t.subject.clone(),
                is_admin: t.role == Role::Admin,
            })
    }
}

/// Extracts the credential from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Subjects with a job in flight. One job per subject at a time.
#[derive(Clone, Default)]
pub struct JobRegistry {
    running: Arc<Mutex<HashSet<String>>>,
}

/// Releases the subject's slot when dropped.
pub struct JobSlot {
    running: Arc<Mutex<HashSet<String>>>,
    subject: String,
}

impl JobRegistry {
    pub fn try_acquire(&self, subject: &str) -> Option<JobSlot> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(subject.to_string()) {
            return None;
        }
        Some(JobSlot {
            running: self.running.clone(),
            subject: subject.to_string(),
        })
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.subject);
        }
    }
}
