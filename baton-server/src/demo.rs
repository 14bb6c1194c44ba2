//! In-memory counters standing in for application data.

use async_trait::async_trait;
use baton_core::{DatumError, DistDatum};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const COUNTER_TYPE: &str = "counter";

pub struct Counter {
    id: i64,
    value: AtomicU64,
    owned: AtomicBool,
}

impl Counter {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            value: AtomicU64::new(0),
            owned: AtomicBool::new(false),
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::SeqCst)
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DistDatum for Counter {
    fn id(&self) -> i64 {
        self.id
    }

    fn datum_type(&self) -> &str {
        COUNTER_TYPE
    }

    async fn relinquish(&self) -> Result<(), DatumError> {
        if !self.is_owned() {
            tracing::debug!(id = self.id, "counter was never taken over, nothing to flush");
        }
        self.owned.store(false, Ordering::SeqCst);
        tracing::info!(id = self.id, value = self.value(), "counter flushed");
        Ok(())
    }

    async fn acquire(&self) -> Result<(), DatumError> {
        self.owned.store(true, Ordering::SeqCst);
        self.value.fetch_add(1, Ordering::SeqCst);
        tracing::info!(id = self.id, "counter taken over");
        Ok(())
    }

    fn name(&self) -> String {
        format!("{}-{}", COUNTER_TYPE, self.id)
    }
}

pub fn inventory(count: usize) -> Vec<Arc<Counter>> {
    (0..count as i64).map(|id| Arc::new(Counter::new(id))).collect()
}
