use std::collections::VecDeque;

use anyhow::Result;

use crate::{
    db::recipients::RecipientRepository,
    domain::{BroadcastJob, BroadcastScope, Recipient},
};

/// Forward-only walk over a job's recipients, resumable from a persisted key.
///
/// Pages are read lazily with `key > position`, so each page reflects the
/// `can_dm` flags at read time and a cursor rebuilt from the same key
/// yields the same remaining suffix.
pub struct RecipientCursor {
    scope: BroadcastScope,
    position: Option<i64>,
    page_size: u32,
    buffer: VecDeque<Recipient>,
    finished: bool,
}

impl RecipientCursor {
    pub fn new(scope: BroadcastScope, position: Option<i64>, page_size: u32) -> Self {
        Self {
            scope,
            position,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            finished: false,
        }
    }

    pub fn resume(job: &BroadcastJob, page_size: u32) -> Self {
        Self::new(job.scope, job.cursor.position(job.scope), page_size)
    }

    pub fn position(&self) -> Option<i64> {
        self.position
    }

    pub async fn next(&mut self, registry: &RecipientRepository) -> Result<Option<Recipient>> {
        if self.buffer.is_empty() && !self.finished {
            let page = registry
                .page(self.scope, self.position, self.page_size)
                .await?;
            if page.is_empty() {
                self.finished = true;
            }
            self.buffer.extend(page);
        }

        let next = self.buffer.pop_front();
        if let Some(recipient) = next {
            self.position = Some(recipient.key);
        }
        Ok(next)
    }
}
