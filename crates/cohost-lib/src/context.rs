//! Context store: bounded window of recent turns plus running chat stats.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use cohost_core::types::{ACTIVE_SPEAKER_WINDOW, ChatStats, ContextView, EmoteCount, Role, Turn};

/// Number of emotes reported in [`ChatStats::top_emotes`].
pub const TOP_EMOTES: usize = 3;

#[derive(Default)]
struct State {
    turns: VecDeque<Turn>,
    total_messages: u64,
    /// Speaker -> timestamp of their latest message.
    last_seen: HashMap<String, DateTime<Utc>>,
    emotes: HashMap<String, u64>,
}

/// Holds the last `window` turns. Appends are serialized; snapshots clone
/// under a read lock and never see a half-applied append.
pub struct ContextStore {
    window: usize,
    state: RwLock<State>,
}

impl ContextStore {
    /// `window` is clamped to at least 1.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            state: RwLock::new(State::default()),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Insert at the tail, evicting from the head past the window.
    pub fn append(&self, turn: Turn) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if turn.role() == Role::User {
            state.total_messages += 1;
            let at = turn.timestamp();
            state
                .last_seen
                .entry(turn.speaker().to_string())
                .and_modify(|seen| *seen = (*seen).max(at))
                .or_insert(at);
            for tag in turn.tags() {
                *state.emotes.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        state.turns.push_back(turn);
        while state.turns.len() > self.window {
            state.turns.pop_front();
        }
    }

    /// Current window, oldest first.
    pub fn snapshot(&self) -> Vec<Turn> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .turns
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ChatStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        stats_of(&state, Utc::now())
    }

    /// Window and stats taken under one lock.
    pub fn view(&self) -> ContextView {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        ContextView {
            window: self.window,
            turns: state.turns.iter().cloned().collect(),
            stats: stats_of(&state, Utc::now()),
        }
    }

    /// Drop all turns and reset stats.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = State::default();
    }
}

fn stats_of(state: &State, now: DateTime<Utc>) -> ChatStats {
    let mut emotes: Vec<EmoteCount> = state
        .emotes
        .iter()
        .map(|(emote, &count)| EmoteCount {
            emote: emote.clone(),
            count,
        })
        .collect();
    // Most used first; ties broken by name so output is stable.
    emotes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emote.cmp(&b.emote)));
    emotes.truncate(TOP_EMOTES);

    // A timestamp ahead of `now` fails `to_std` and counts as active.
    let active_speakers = state
        .last_seen
        .values()
        .filter(|&&at| (now - at).to_std().map_or(true, |age| age <= ACTIVE_SPEAKER_WINDOW))
        .count();

    ChatStats {
        total_messages: state.total_messages,
        unique_speakers: state.last_seen.len(),
        active_speakers,
        top_emotes: emotes,
    }
}
