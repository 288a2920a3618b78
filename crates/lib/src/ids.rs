//! Request id generation: `<prefix>-<counter>-<random>`.
//!
//! The counter makes ids unique within the process regardless of clock
//! resolution; the random suffix keeps ids from different processes (several
//! clients sharing one gateway) from colliding.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RequestIds {
    counter: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", prefix, n, &random[..8])
    }
}
