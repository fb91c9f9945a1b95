//! Per-prompt reordering of answer fragments.
//!
//! The broker only preserves order per consumer until something is
//! requeued; after a nack or a channel reset, fragment `n + 1` can arrive
//! before fragment `n`. [`ReorderBuffer`] restores the per-prompt order by
//! holding early fragments until the gap in front of them is filled.
//!
//! The buffer is generic over a `token` travelling with each fragment. The
//! relay uses the broker delivery as the token so that a held fragment stays
//! unacknowledged until it is actually forwarded.
//!
//! Streams that never see a final fragment (a generator that died for good,
//! a bare-text prompt whose id changes on every redelivery) would stay open
//! forever. The number of open streams is therefore bounded; past the bound
//! the least recently active stream is closed to make room.

use super::fragment::AnswerFragment;
use crate::prompt::PromptId;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Outcome of offering a fragment to the buffer.
#[derive(Debug)]
pub enum Admission<T> {
    /// The fragment is the next expected one and may be forwarded now.
    Ready(AnswerFragment, T),
    /// The fragment is ahead of the expected sequence and is now held.
    Held,
    /// The fragment was already forwarded, already held, or its prompt is
    /// finished or abandoned.
    Duplicate(AnswerFragment, T),
    /// Holding the fragment would exceed the per-prompt bound.
    Overflow(AnswerFragment, T),
}

#[derive(Debug)]
struct StreamState<T> {
    next_sequence: u64,
    held: BTreeMap<u64, (AnswerFragment, T)>,
    last_active: u64,
}

impl<T> Default for StreamState<T> {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            held: BTreeMap::new(),
            last_active: 0,
        }
    }
}

/// A stream closed to make room for a new one.
#[derive(Debug)]
pub struct Eviction<T> {
    pub prompt_id: PromptId,
    /// Fragments that were still held for it, in sequence order.
    pub held: Vec<(AnswerFragment, T)>,
}

/// Bounded set of prompt ids whose streams are closed.
#[derive(Debug)]
struct ClosedStreams {
    order: VecDeque<PromptId>,
    members: HashSet<PromptId>,
    capacity: usize,
}

impl ClosedStreams {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: PromptId) {
        if self.capacity == 0 || !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &PromptId) -> bool {
        self.members.contains(id)
    }
}

/// Restores per-prompt sequence order over an interleaved fragment stream.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    streams: HashMap<PromptId, StreamState<T>>,
    closed: ClosedStreams,
    max_held_per_prompt: usize,
    max_open_streams: usize,
    clock: u64,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer holding at most `max_held_per_prompt` early fragments
    /// per prompt and remembering the last `closed_history` finished prompts.
    pub fn new(max_held_per_prompt: usize, closed_history: usize) -> Self {
        Self {
            streams: HashMap::new(),
            closed: ClosedStreams::new(closed_history),
            max_held_per_prompt,
            max_open_streams: usize::MAX,
            clock: 0,
        }
    }

    /// Bound the number of prompts with an open stream.
    pub fn with_max_open_streams(mut self, max: usize) -> Self {
        self.max_open_streams = max.max(1);
        self
    }

    /// Close the least recently active stream when a fragment of `prompt_id`
    /// would open one stream too many.
    ///
    /// The evicted prompt is remembered as closed, so its later fragments
    /// are duplicates. Call before [`admit`](Self::admit).
    pub fn make_room_for(&mut self, prompt_id: &PromptId) -> Option<Eviction<T>> {
        if self.streams.len() < self.max_open_streams
            || self.streams.contains_key(prompt_id)
            || self.closed.contains(prompt_id)
        {
            return None;
        }
        let idle = self
            .streams
            .iter()
            .min_by_key(|(_, state)| state.last_active)
            .map(|(id, _)| id.clone())?;
        let held = self.close(&idle);
        Some(Eviction {
            prompt_id: idle,
            held,
        })
    }

    /// Offer a freshly received fragment.
    pub fn admit(&mut self, fragment: AnswerFragment, token: T) -> Admission<T> {
        if self.closed.contains(&fragment.prompt_id) {
            return Admission::Duplicate(fragment, token);
        }

        let max_held = self.max_held_per_prompt;
        let now = self.tick();
        let state = self.streams.entry(fragment.prompt_id.clone()).or_default();
        state.last_active = now;

        if fragment.sequence < state.next_sequence || state.held.contains_key(&fragment.sequence) {
            return Admission::Duplicate(fragment, token);
        }
        if fragment.sequence == state.next_sequence {
            return Admission::Ready(fragment, token);
        }
        if state.held.len() >= max_held {
            return Admission::Overflow(fragment, token);
        }
        state.held.insert(fragment.sequence, (fragment, token));
        Admission::Held
    }

    /// Record that `fragment` was forwarded.
    ///
    /// Advances the expected sequence; a final fragment closes the stream and
    /// returns whatever was still held for it (stale tail of an older
    /// attempt) so the caller can settle those tokens.
    pub fn commit(&mut self, fragment: &AnswerFragment) -> Vec<(AnswerFragment, T)> {
        if fragment.is_final {
            return self.close(&fragment.prompt_id);
        }
        let now = self.tick();
        if let Some(state) = self.streams.get_mut(&fragment.prompt_id)
            && fragment.sequence == state.next_sequence
        {
            state.next_sequence += 1;
            state.last_active = now;
        }
        Vec::new()
    }

    /// Take the held fragment that has become next in line, if any.
    pub fn take_ready(&mut self, prompt_id: &PromptId) -> Option<(AnswerFragment, T)> {
        let state = self.streams.get_mut(prompt_id)?;
        let next = state.next_sequence;
        state.held.remove(&next)
    }

    /// Give up on a prompt: drop its state, remember it as closed, and
    /// return its held fragments in sequence order.
    pub fn abandon(&mut self, prompt_id: &PromptId) -> Vec<(AnswerFragment, T)> {
        self.close(prompt_id)
    }

    /// Remove every held fragment across all prompts, keeping the expected
    /// sequences. Used when the tokens become invalid (channel reset).
    pub fn drain_held(&mut self) -> Vec<(AnswerFragment, T)> {
        self.streams
            .values_mut()
            .flat_map(|state| std::mem::take(&mut state.held).into_values())
            .collect()
    }

    /// Expected next sequence for a prompt with an open stream.
    pub fn expected_sequence(&self, prompt_id: &PromptId) -> Option<u64> {
        self.streams.get(prompt_id).map(|s| s.next_sequence)
    }

    /// Number of fragments currently held for a prompt.
    pub fn held_count(&self, prompt_id: &PromptId) -> usize {
        self.streams.get(prompt_id).map_or(0, |s| s.held.len())
    }

    /// Number of prompts with an open stream.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_closed(&self, prompt_id: &PromptId) -> bool {
        self.closed.contains(prompt_id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn close(&mut self, prompt_id: &PromptId) -> Vec<(AnswerFragment, T)> {
        self.closed.insert(prompt_id.clone());
        self.streams
            .remove(prompt_id)
            .map(|state| state.held.into_values().collect())
            .unwrap_or_default()
    }
}
