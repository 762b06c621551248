// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Broadcast event bus with a bounded replay buffer.
//!
//! Delivery is best-effort: a slow observer that falls more than the
//! broadcast capacity behind sees a `Lagged` error and misses events older
//! than the buffer tail.  Within one observer, events arrive in
//! produce-order; no global ordering across sessions is guaranteed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::{Event, EventKind};

/// In-memory replay buffer for late-joining observers.
pub const EVENT_BUFFER_CAP: usize = 1_000;
/// Tail length shipped inside an observer's init frame.
pub const INIT_TAIL_LEN: usize = 100;

struct BusState {
    buffer: VecDeque<Event>,
    /// Per-session monotonic sequence counters.
    session_seq: HashMap<String, u64>,
    /// Counter for events that carry no session.
    daemon_seq: u64,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            state: Mutex::new(BusState {
                buffer: VecDeque::with_capacity(EVENT_BUFFER_CAP),
                session_seq: HashMap::new(),
                daemon_seq: 0,
            }),
        }
    }

    /// Publish an event: assigns its sequence number, buffers it, and
    /// broadcasts it.  No subscribers is fine (nobody connected yet).
    pub fn publish(
        &self,
        kind: EventKind,
        session_id: Option<&str>,
        channel: Option<&str>,
        data: Value,
    ) -> Event {
        let event = {
            let mut state = self.state.lock().expect("event bus state poisoned");
            let seq = match session_id {
                Some(id) => {
                    let ctr = state.session_seq.entry(id.to_string()).or_insert(0);
                    *ctr += 1;
                    *ctr
                }
                None => {
                    state.daemon_seq += 1;
                    state.daemon_seq
                }
            };
            let event = Event {
                kind,
                session_id: session_id.map(str::to_string),
                channel: channel.map(str::to_string),
                seq,
                timestamp: Utc::now(),
                data,
            };
            if state.buffer.len() == EVENT_BUFFER_CAP {
                state.buffer.pop_front();
            }
            state.buffer.push_back(event.clone());
            event
        };

        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// The most recent events (≤ [`INIT_TAIL_LEN`]) for an init frame.
    pub fn recent(&self) -> Vec<Event> {
        let state = self.state.lock().expect("event bus state poisoned");
        let skip = state.buffer.len().saturating_sub(INIT_TAIL_LEN);
        state.buffer.iter().skip(skip).cloned().collect()
    }

    /// Number of currently attached observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
