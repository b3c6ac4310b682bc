use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::lock;
use crate::record::CheckpointRecord;
use crate::store::CompletedPart;

/// Per-operation state written by workers and read once after they drain.
#[derive(Debug)]
pub(crate) struct TransferContext {
    etags: Mutex<BTreeMap<u32, String>>,
    completed: Mutex<Vec<bool>>,
    hard_failure: AtomicBool,
    errors: Mutex<Vec<String>>,
}

impl TransferContext {
    pub fn new(part_count: usize) -> Self {
        Self {
            etags: Mutex::new(BTreeMap::new()),
            completed: Mutex::new(vec![false; part_count]),
            hard_failure: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Context seeded with the parts and etags a record already holds.
    pub fn from_record(record: &CheckpointRecord) -> Self {
        let context = Self::new(record.parts().len());
        {
            let mut completed = lock(&context.completed);
            for (slot, part) in completed.iter_mut().zip(record.parts()) {
                *slot = part.is_completed;
            }
        }
        {
            let mut etags = lock(&context.etags);
            for entry in record.part_etags() {
                etags.insert(entry.part_number, entry.etag.clone());
            }
        }
        context
    }

    /// Marks a part completed, recording its etag when there is one.
    pub fn complete(&self, part_number: u32, etag: Option<String>) {
        if let Some(etag) = etag {
            lock(&self.etags).insert(part_number, etag);
        }
        let index = (part_number as usize).saturating_sub(1);
        if let Some(slot) = lock(&self.completed).get_mut(index) {
            *slot = true;
        }
    }

    pub fn fail_hard(&self) {
        self.hard_failure.store(true, Ordering::SeqCst);
    }

    pub fn has_hard_failure(&self) -> bool {
        self.hard_failure.load(Ordering::SeqCst)
    }

    pub fn record_error(&self, message: String) {
        lock(&self.errors).push(message);
    }

    pub fn first_error(&self) -> Option<String> {
        lock(&self.errors).first().cloned()
    }

    pub fn all_completed(&self) -> bool {
        lock(&self.completed).iter().all(|&done| done)
    }

    /// Recorded etags, sorted by part number.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        lock(&self.etags)
            .iter()
            .map(|(&part_number, etag)| CompletedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect()
    }
}
