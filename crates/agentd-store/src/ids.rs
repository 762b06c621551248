// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Mutex;

use crate::atomic::write_atomic;
use crate::error::StoreError;

/// Monotonic session ID allocator backed by `agents/proc/_next`.
///
/// The file holds the *next* ID as a decimal string.  Allocation is
/// write-then-read ordered: read the current value, persist `current + 1`,
/// then hand out `current`.  IDs are therefore strictly monotonic with no
/// gaps as long as the counter file is intact; a partially written or
/// non-numeric counter is treated as corrupt and aborts startup.
#[derive(Debug)]
pub struct IdAllocator {
    path: PathBuf,
    lock: Mutex<()>,
}

impl IdAllocator {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Validate the counter file without allocating.  Called once at daemon
    /// startup so corruption surfaces as a fatal diagnostic, not mid-run.
    pub fn verify(&self) -> Result<(), StoreError> {
        if !self.path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&self.path)?;
        text.trim()
            .parse::<u64>()
            .map(|_| ())
            .map_err(|_| StoreError::CorruptCounter(self.path.clone()))
    }

    /// Allocate the next session ID as a decimal string.
    pub fn allocate(&self) -> Result<String, StoreError> {
        let _guard = self.lock.lock().expect("id counter lock poisoned");

        let current: u64 = if self.path.exists() {
            let text = std::fs::read_to_string(&self.path)?;
            text.trim()
                .parse()
                .map_err(|_| StoreError::CorruptCounter(self.path.clone()))?
        } else {
            0
        };

        write_atomic(&self.path, format!("{}", current + 1).as_bytes())?;
        Ok(current.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
