//! Block-based unique integer allocation over a shared counter.
//!
//! Each instance reserves `block_size` consecutive integers with one atomic
//! increment against the shared counter and hands them out locally. Two
//! instances sharing a counter can never see overlapping blocks, because the
//! store is the only place the counter moves.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::codec;
use crate::storage::CounterStore;

/// Name of the shared counter used when none is configured.
pub const DEFAULT_COUNTER_KEY: &str = "counter:global";
pub const DEFAULT_BLOCK_SIZE: i64 = 1_000_000;
pub const DEFAULT_CODE_WIDTH: usize = 7;
/// Widest code whose first full-width value still fits the signed counter.
pub const MAX_CODE_WIDTH: usize = 11;
/// `counter_start(DEFAULT_CODE_WIDTH)`, the first seven-digit value.
pub const DEFAULT_COUNTER_START: i64 = 56_800_235_584;

/// First counter value whose code needs all `width` digits, for widths in
/// `1..=MAX_CODE_WIDTH`.
pub fn counter_start(width: usize) -> Option<i64> {
    if !(1..=MAX_CODE_WIDTH).contains(&width) {
        return None;
    }
    codec::min_full_width(width).and_then(|v| i64::try_from(v).ok())
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("counter store failed: {0}")]
    Store(#[source] anyhow::Error),
    #[error("allocated value {value} exceeds the code space maximum {max}")]
    SpaceExhausted { value: u64, max: u64 },
    #[error("counter produced negative value {0}")]
    NegativeValue(i64),
    #[error("block size must be positive")]
    InvalidBlockSize,
}

/// Inclusive range of integers reserved by one allocator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterBlock {
    pub start: i64,
    pub end: i64,
    /// Next value to hand out; `end + 1` once exhausted
    current: i64,
}

impl CounterBlock {
    fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            current: start,
        }
    }

    fn take(&mut self) -> Option<i64> {
        if self.current > self.end {
            return None;
        }
        let value = self.current;
        self.current += 1;
        Some(value)
    }

    pub fn remaining(&self) -> i64 {
        self.end + 1 - self.current
    }
}

pub struct Allocator {
    store: Arc<dyn CounterStore>,
    counter_key: String,
    block_size: i64,
    block: Mutex<Option<CounterBlock>>,
}

impl Allocator {
    pub fn new(
        store: Arc<dyn CounterStore>,
        counter_key: impl Into<String>,
        block_size: i64,
    ) -> Result<Self, AllocationError> {
        if block_size <= 0 {
            return Err(AllocationError::InvalidBlockSize);
        }
        Ok(Self {
            store,
            counter_key: counter_key.into(),
            block_size,
            block: Mutex::new(None),
        })
    }

    /// Create the shared counter at `start` if no instance has done so yet.
    pub async fn ensure_counter(&self, start: i64) -> Result<(), AllocationError> {
        self.store
            .init_counter(&self.counter_key, start)
            .await
            .map_err(AllocationError::Store)
    }

    /// Next unique integer. Never falls back to local generation on failure.
    pub async fn next(&self) -> Result<i64, AllocationError> {
        let mut guard = self.block.lock().await;

        if let Some(value) = guard.as_mut().and_then(CounterBlock::take) {
            return Ok(value);
        }

        let mut block = self.fetch_block().await?;
        let value = block.take().ok_or(AllocationError::InvalidBlockSize)?;
        *guard = Some(block);
        Ok(value)
    }

    /// Next integer encoded as a fixed-width base62 short code.
    pub async fn next_code(&self, width: usize) -> Result<String, AllocationError> {
        let value = self.next().await?;
        let value = u64::try_from(value).map_err(|_| AllocationError::NegativeValue(value))?;

        let max = codec::max_for_width(width);
        if value > max {
            return Err(AllocationError::SpaceExhausted { value, max });
        }
        Ok(codec::encode(value, width))
    }

    /// Values still available in the local block.
    pub async fn remaining(&self) -> i64 {
        self.block
            .lock()
            .await
            .as_ref()
            .map_or(0, CounterBlock::remaining)
    }

    async fn fetch_block(&self) -> Result<CounterBlock, AllocationError> {
        // The counter holds the next unreserved value; after the increment it
        // points past our block.
        let after = self
            .store
            .increment_by(&self.counter_key, self.block_size)
            .await
            .map_err(AllocationError::Store)?;

        let block = CounterBlock::new(after - self.block_size, after - 1);
        info!(
            counter = %self.counter_key,
            start = block.start,
            end = block.end,
            "📦 Reserved counter block"
        );
        Ok(block)
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("counter_key", &self.counter_key)
            .field("block_size", &self.block_size)
            .finish()
    }
}
