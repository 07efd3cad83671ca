//! Observability events and credential redaction.
//!
//! The dispatcher emits one [`AttemptEvent`] per network attempt and one
//! [`DispatchEvent`] per dispatch to the configured [`EventSink`]. Messages are
//! run through [`redact`] before they are placed on an event.

use std::sync::{LazyLock, Mutex};

use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::marketplace::{ErrorKind, OperationKind};
use crate::ProviderId;

const MASK: &str = "***";

/// Secrets shorter than this are left alone; masking them would shred
/// ordinary words in messages.
const MIN_SECRET_LEN: usize = 4;

static BEARER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*")
        .expect("BEARER_PATTERN is a valid regex pattern")
});

static PARAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(api_key|apikey|token|access_token|refresh_token|client_secret|secret|password|code)=([^&\s]+)",
    )
    .expect("PARAM_PATTERN is a valid regex pattern")
});

static JSON_FIELD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)"(api_key|access_token|refresh_token|client_secret|secret|password|id_token)"\s*:\s*"[^"]*""#,
    )
    .expect("JSON_FIELD_PATTERN is a valid regex pattern")
});

/// Masks credentials in `text`.
///
/// Removes every exact occurrence of `secrets`, bearer tokens, secret-like
/// query/form parameters and secret-like JSON string fields.
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut redacted = text.to_owned();
    for secret in secrets {
        if secret.len() >= MIN_SECRET_LEN {
            redacted = redacted.replace(secret, MASK);
        }
    }

    let redacted = BEARER_PATTERN.replace_all(&redacted, format!("$1 {MASK}"));
    let redacted = PARAM_PATTERN.replace_all(&redacted, format!("$1={MASK}"));
    let redacted = JSON_FIELD_PATTERN.replace_all(&redacted, format!(r#""$1":"{MASK}""#));
    redacted.into_owned()
}

/// One network attempt against one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptEvent {
    pub dispatch_id: Uuid,
    pub provider: ProviderId,
    pub operation: OperationKind,
    /// 1-based attempt number within the provider's retry sequence.
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub success: bool,
    pub status: Option<u16>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub next_backoff_ms: Option<u64>,
}

/// Aggregate result of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchEvent {
    pub dispatch_id: Uuid,
    pub operation: OperationKind,
    pub successful_providers: Vec<ProviderId>,
    pub failed_providers: Vec<ProviderId>,
    pub overall_success: bool,
    pub partial_success: bool,
    pub total_elapsed_ms: u64,
    pub error: Option<String>,
}

/// Receiver for dispatch observability events.
///
/// Called inline from dispatch units; implementations should not block.
pub trait EventSink: Send + Sync {
    fn on_attempt(&self, event: &AttemptEvent);
    fn on_dispatch(&self, event: &DispatchEvent);
}

/// Default sink writing events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_attempt(&self, event: &AttemptEvent) {
        if event.success {
            tracing::info!(
                dispatch_id = %event.dispatch_id,
                provider = %event.provider,
                operation = %event.operation,
                attempt = event.attempt,
                elapsed_ms = event.elapsed_ms,
                "provider attempt succeeded"
            );
        } else {
            tracing::warn!(
                dispatch_id = %event.dispatch_id,
                provider = %event.provider,
                operation = %event.operation,
                attempt = event.attempt,
                elapsed_ms = event.elapsed_ms,
                status = ?event.status,
                error_kind = ?event.error_kind,
                error = event.error.as_deref().unwrap_or_default(),
                next_backoff_ms = ?event.next_backoff_ms,
                "provider attempt failed"
            );
        }
    }

    fn on_dispatch(&self, event: &DispatchEvent) {
        let successful = join_ids(&event.successful_providers);
        let failed = join_ids(&event.failed_providers);
        if event.overall_success {
            tracing::info!(
                dispatch_id = %event.dispatch_id,
                operation = %event.operation,
                successful = %successful,
                failed = %failed,
                partial = event.partial_success,
                total_elapsed_ms = event.total_elapsed_ms,
                "dispatch completed"
            );
        } else {
            tracing::warn!(
                dispatch_id = %event.dispatch_id,
                operation = %event.operation,
                failed = %failed,
                total_elapsed_ms = event.total_elapsed_ms,
                error = event.error.as_deref().unwrap_or_default(),
                "dispatch failed for every provider"
            );
        }
    }
}

fn join_ids(ids: &[ProviderId]) -> String {
    ids.iter()
        .map(ProviderId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Sink that keeps every event in memory, for assertions and debugging.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    attempts: Mutex<Vec<AttemptEvent>>,
    dispatches: Mutex<Vec<DispatchEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<AttemptEvent> {
        self.attempts
            .lock()
            .expect("recording sink lock is not poisoned")
            .clone()
    }

    pub fn attempts_for(&self, provider: &ProviderId) -> Vec<AttemptEvent> {
        self.attempts()
            .into_iter()
            .filter(|event| &event.provider == provider)
            .collect()
    }

    pub fn dispatches(&self) -> Vec<DispatchEvent> {
        self.dispatches
            .lock()
            .expect("recording sink lock is not poisoned")
            .clone()
    }
}

impl EventSink for RecordingEventSink {
    fn on_attempt(&self, event: &AttemptEvent) {
        self.attempts
            .lock()
            .expect("recording sink lock is not poisoned")
            .push(event.clone());
    }

    fn on_dispatch(&self, event: &DispatchEvent) {
        self.dispatches
            .lock()
            .expect("recording sink lock is not poisoned")
            .push(event.clone());
    }
}
