use std::collections::HashSet;
use std::num::NonZeroUsize;

use crate::ledger::RecipientLedger;
use crate::recipient::{Recipient, RecipientTable};

/// Default chunk size when no provider quota applies.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Recipients of one chunk of the table that still need sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub index: usize,
    pub recipients: Vec<Recipient>,
}

impl PlannedBatch {
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

/// Consecutive chunks in table order; chunk k covers `[k*B, min((k+1)*B, N))`.
pub fn partition(table: &RecipientTable, batch_size: NonZeroUsize) -> std::slice::Chunks<'_, Recipient> {
    table.as_slice().chunks(batch_size.get())
}

/// First chunk with a recipient not yet recorded as sent, filtered to those recipients.
///
/// Chunks are always recomputed from the whole table, so recipients appended
/// after earlier batches went out land in the right chunk.
pub fn next_batch<L: RecipientLedger + ?Sized>(
    ledger: &L,
    campaign: &str,
    table: &RecipientTable,
    batch_size: NonZeroUsize,
) -> Option<PlannedBatch> {
    if table.is_empty() {
        return None;
    }
    let sent = ledger.sent_emails(campaign);
    next_batch_excluding(table, batch_size, &sent)
}

pub fn next_batch_excluding(
    table: &RecipientTable,
    batch_size: NonZeroUsize,
    exclude: &HashSet<String>,
) -> Option<PlannedBatch> {
    partition(table, batch_size)
        .enumerate()
        .find_map(|(index, chunk)| {
            let recipients: Vec<Recipient> = chunk
                .iter()
                .filter(|r| !exclude.contains(&r.email))
                .cloned()
                .collect();
            (!recipients.is_empty()).then_some(PlannedBatch { index, recipients })
        })
}
