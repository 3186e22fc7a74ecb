//! Authoritative host-side game state: draw history, number pool, winners.

use super::ids::{generate_distinct_game_id, generate_game_id};
use super::types::{GameId, GameSnapshot, WinnerRecord, MAX_NUMBER};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Result of a draw request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Drawn(u8),
    /// Game inactive (reset pending); nothing changed
    Paused,
    /// Pool empty; nothing changed
    Exhausted,
}

/// Full host state. `drawn ∪ remaining = {1..=75}` and the two never overlap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    game_id: GameId,
    host_id: String,
    /// Most recent first
    drawn_numbers: Vec<u8>,
    remaining_numbers: Vec<u8>,
    active: bool,
    winners: Vec<WinnerRecord>,
}

impl GameState {
    pub fn fresh(game_id: GameId, host_id: String) -> Self {
        Self {
            game_id,
            host_id,
            drawn_numbers: Vec::new(),
            remaining_numbers: (1..=MAX_NUMBER).collect(),
            active: true,
            winners: Vec::new(),
        }
    }

    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn drawn_numbers(&self) -> &[u8] {
        &self.drawn_numbers
    }

    pub fn remaining_numbers(&self) -> &[u8] {
        &self.remaining_numbers
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn winners(&self) -> &[WinnerRecord] {
        &self.winners
    }

    pub fn current_number(&self) -> Option<u8> {
        self.drawn_numbers.first().copied()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_numbers.is_empty()
    }

    /// Check the pool invariants; used on anything read back from storage
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::with_capacity(MAX_NUMBER as usize);
        let all = self.drawn_numbers.iter().chain(self.remaining_numbers.iter());
        for &n in all {
            if n == 0 || n > MAX_NUMBER || !seen.insert(n) {
                return false;
            }
        }
        seen.len() == MAX_NUMBER as usize
    }

    /// Decode a persisted blob. Malformed or inconsistent data is treated as absent.
    pub fn from_json(raw: &str) -> Option<Self> {
        match serde_json::from_str::<GameState>(raw) {
            Ok(state) if state.is_consistent() => Some(state),
            Ok(state) => {
                tracing::warn!(
                    game_id = %state.game_id,
                    "Discarding inconsistent persisted game state"
                );
                None
            }
            Err(e) => {
                tracing::debug!("Discarding malformed persisted game state: {}", e);
                None
            }
        }
    }

    pub fn snapshot(&self, last_update: u64) -> GameSnapshot {
        GameSnapshot {
            game_id: self.game_id.clone(),
            host_id: self.host_id.clone(),
            current_number: self.current_number(),
            drawn_numbers: self.drawn_numbers.clone(),
            total_drawn: self.drawn_numbers.len(),
            active: self.active,
            winners: self.winners.clone(),
            last_update,
        }
    }
}

/// Owns the current [`GameState`] and the randomness used to draw from it
pub struct GameStateStore {
    state: GameState,
    rng: StdRng,
}

impl GameStateStore {
    /// Fresh game with a random id
    pub fn new(host_id: String) -> Self {
        Self::with_rng(StdRng::from_entropy(), host_id)
    }

    pub fn with_rng(mut rng: StdRng, host_id: String) -> Self {
        let game_id = generate_game_id(&mut rng);
        Self {
            state: GameState::fresh(game_id, host_id),
            rng,
        }
    }

    /// Continue from a previously persisted state
    pub fn from_state(state: GameState, rng: StdRng) -> Self {
        Self { state, rng }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn game_id(&self) -> &GameId {
        &self.state.game_id
    }

    pub fn current_number(&self) -> Option<u8> {
        self.state.current_number()
    }

    /// Move one uniformly chosen number from the pool to the front of the history
    pub fn draw(&mut self) -> DrawOutcome {
        if !self.state.active {
            return DrawOutcome::Paused;
        }
        if self.state.remaining_numbers.is_empty() {
            return DrawOutcome::Exhausted;
        }

        let index = self.rng.gen_range(0..self.state.remaining_numbers.len());
        let number = self.state.remaining_numbers.swap_remove(index);
        self.state.drawn_numbers.insert(0, number);
        DrawOutcome::Drawn(number)
    }

    /// Put back the number just drawn. Only the most recent draw can be
    /// returned; anything else is refused.
    pub fn undo_draw(&mut self, number: u8) -> bool {
        if self.state.drawn_numbers.first() != Some(&number) {
            return false;
        }
        self.state.drawn_numbers.remove(0);
        self.state.remaining_numbers.push(number);
        true
    }

    /// Mark the game inactive while a reset is pending
    pub fn deactivate(&mut self) {
        self.state.active = false;
    }

    /// Replace the whole state; only the host identity survives
    pub fn reset(&mut self) -> &GameState {
        let game_id = generate_distinct_game_id(&mut self.rng, &self.state.game_id);
        let host_id = std::mem::take(&mut self.state.host_id);
        self.state = GameState::fresh(game_id, host_id);
        &self.state
    }

    /// Append-only
    pub fn record_winner(&mut self, record: WinnerRecord) {
        self.state.winners.push(record);
    }
}
