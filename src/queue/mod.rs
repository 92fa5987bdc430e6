pub mod click_queue;
pub mod dead_letter;
pub mod durable;
pub mod overflow;

use thiserror::Error;

use crate::storage::KvError;

pub use click_queue::{backoff, ClickQueue, FlushReport, IngestReport, QueueOutcome, QueueSnapshot};
pub use dead_letter::{DeadLetter, DeadLetterEntry, DeadLetterQueue};
pub use durable::DurableStorage;
pub use overflow::OverflowStorage;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("durable storage failed: {0}")]
    Storage(#[from] KvError),
    #[error("overflow storage failed: {0}")]
    Overflow(anyhow::Error),
}
