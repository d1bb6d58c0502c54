//! Hot-path click capture: serialize and append, nothing else.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::analytics::models::RawClickEvent;
use crate::storage::EventBuffer;

/// Namespace of every click buffer key.
pub const BUFFER_PREFIX: &str = "click:";

pub fn buffer_key(short_code: &str) -> String {
    format!("{}{}", BUFFER_PREFIX, short_code)
}

#[derive(Clone)]
pub struct Ingestor {
    buffer: Arc<dyn EventBuffer>,
}

impl Ingestor {
    pub fn new(buffer: Arc<dyn EventBuffer>) -> Self {
        Self { buffer }
    }

    /// Stamp a click with the current instant and append it to its buffer.
    pub async fn record(
        &self,
        short_code: &str,
        ip: &str,
        user_agent: &str,
        referrer: Option<String>,
        is_qr: bool,
    ) -> Result<()> {
        let event = RawClickEvent::new(short_code, ip, user_agent, referrer, is_qr);
        self.record_event(&event).await
    }

    pub async fn record_event(&self, event: &RawClickEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("failed to serialize click event")?;
        self.buffer
            .push(&buffer_key(&event.short_code), &payload)
            .await
            .with_context(|| format!("failed to buffer click for {}", event.short_code))
    }

    /// Record on a separate task. Failures are logged and never reach the caller.
    pub fn record_detached(
        &self,
        short_code: String,
        ip: String,
        user_agent: String,
        referrer: Option<String>,
        is_qr: bool,
    ) -> JoinHandle<()> {
        let ingestor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = ingestor
                .record(&short_code, &ip, &user_agent, referrer, is_qr)
                .await
            {
                warn!(short_code = %short_code, error = %e, "Dropping click event");
            }
        })
    }
}
