//! Tiered body buffer pool for the intranet server.
//!
//! Inbound bodies are copied into pooled buffers sized by tier (64, 128,
//! 256, 512 KiB). Requests larger than the top tier bypass the pool.
//! Buffers return to their tier on drop, so release happens exactly once.

use std::sync::{Arc, Mutex};

const TIERS: [usize; 4] = [64 * 1024, 128 * 1024, 256 * 1024, 512 * 1024];

/// Retained buffers per tier.
const MAX_PER_TIER: usize = 32;

#[derive(Debug, Default)]
struct Shelves {
    tiers: [Vec<Vec<u8>>; 4],
}

/// Shared pool handle.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    shelves: Arc<Mutex<Shelves>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a buffer of exactly `len` usable bytes.
    pub fn acquire(&self, len: usize) -> PooledBuf {
        let tier = TIERS.iter().position(|&cap| len <= cap);

        let mut data = match tier {
            Some(idx) => {
                let mut shelves = self.shelves.lock().unwrap_or_else(|e| e.into_inner());
                shelves.tiers[idx].pop().unwrap_or_else(|| Vec::with_capacity(TIERS[idx]))
            }
            None => Vec::with_capacity(len),
        };
        data.resize(len, 0);

        PooledBuf {
            data,
            tier,
            pool: Arc::clone(&self.shelves),
        }
    }

    #[cfg(test)]
    fn shelved(&self, tier: usize) -> usize {
        self.shelves.lock().unwrap().tiers[tier].len()
    }
}

/// RAII buffer; returns to its tier when dropped.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    tier: Option<usize>,
    pool: Arc<Mutex<Shelves>>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(idx) = self.tier else {
            return;
        };
        let mut data = std::mem::take(&mut self.data);
        data.clear();

        let mut shelves = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if shelves.tiers[idx].len() < MAX_PER_TIER {
            shelves.tiers[idx].push(data);
        }
    }
}
