//! Host side: the single writer of game state.
//!
//! [`HostController`] owns the [`GameStateStore`] and publishes after every
//! change. [`HostSession`] runs a controller on its own task and serialises
//! UI commands, incoming bingo calls and heartbeat ticks.

use crate::errors::{BingoResult, GameError, SyncError, SyncResult};
use crate::game::{
    number_label, BingoCall, CallKey, DrawOutcome, GameId, GameSnapshot, GameState,
    GameStateStore, WinnerRecord,
};
use crate::sync::{next_transport_change, CallStream, SyncChannel, TransportKind};
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    /// Created but nothing published yet
    Idle,
    Active,
    /// Old game marked inactive, new one not yet published
    Resetting,
    /// Pool empty; only a reset moves on
    Exhausted,
}

/// A bingo call waiting for the host's decision
#[derive(Debug, Clone, PartialEq)]
pub struct CallReview {
    pub key: CallKey,
    pub call: BingoCall,
    /// Claimed numbers that were never drawn. Advisory only.
    pub undrawn: Vec<u8>,
}

impl CallReview {
    pub fn new(key: CallKey, call: BingoCall, drawn: &[u8]) -> Self {
        let undrawn = call
            .marked_numbers
            .iter()
            .copied()
            .filter(|n| !drawn.contains(n))
            .collect();
        Self { key, call, undrawn }
    }

    /// Every claimed number has been drawn
    pub fn is_plausible(&self) -> bool {
        self.undrawn.is_empty()
    }
}

pub struct HostController {
    channel: Arc<dyn SyncChannel>,
    store: GameStateStore,
    phase: HostPhase,
    pending: Vec<CallReview>,
    last_snapshot: Option<GameSnapshot>,
}

impl HostController {
    pub fn new(channel: Arc<dyn SyncChannel>, store: GameStateStore) -> Self {
        Self {
            channel,
            store,
            phase: HostPhase::Idle,
            pending: Vec::new(),
            last_snapshot: None,
        }
    }

    /// Continue `game_id` from whatever the transport has persisted. Missing
    /// or malformed state starts that game afresh.
    pub async fn resume(channel: Arc<dyn SyncChannel>, game_id: GameId, host_id: String) -> Self {
        let state = match channel.load_state(&game_id).await {
            Ok(Some(state)) => {
                info!(
                    game_id = %game_id,
                    drawn = state.drawn_numbers().len(),
                    "Resuming persisted game"
                );
                state
            }
            Ok(None) => {
                info!(game_id = %game_id, "No usable persisted state; starting fresh");
                GameState::fresh(game_id, host_id)
            }
            Err(e) => {
                warn!(game_id = %game_id, "Could not load persisted state ({}); starting fresh", e);
                GameState::fresh(game_id, host_id)
            }
        };
        Self::new(channel, GameStateStore::from_state(state, StdRng::from_entropy()))
    }

    pub fn phase(&self) -> HostPhase {
        self.phase
    }

    pub fn state(&self) -> &GameState {
        self.store.state()
    }

    pub fn game_id(&self) -> &GameId {
        self.store.game_id()
    }

    pub fn channel(&self) -> &Arc<dyn SyncChannel> {
        &self.channel
    }

    pub fn last_snapshot(&self) -> Option<&GameSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn pending_calls(&self) -> &[CallReview] {
        &self.pending
    }

    fn settle_phase(&mut self) {
        let state = self.store.state();
        self.phase = if !state.is_active() {
            HostPhase::Resetting
        } else if state.is_exhausted() {
            HostPhase::Exhausted
        } else {
            HostPhase::Active
        };
    }

    async fn publish(&mut self) -> SyncResult<GameSnapshot> {
        let snapshot = self.channel.publish(self.store.state()).await?;
        self.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Publish the initial state and enter play
    pub async fn start(&mut self) -> SyncResult<GameSnapshot> {
        let snapshot = self.publish().await?;
        self.settle_phase();
        info!(game_id = %self.game_id(), transport = %self.channel.kind(), "Game started");
        Ok(snapshot)
    }

    /// Draw and publish. Paused and exhausted draws change nothing and
    /// publish nothing; a draw that cannot be published is undone.
    pub async fn draw(&mut self) -> BingoResult<DrawOutcome> {
        if self.phase == HostPhase::Idle {
            return Err(GameError::NotStarted.into());
        }

        let outcome = self.store.draw();
        match outcome {
            DrawOutcome::Drawn(number) => {
                if let Err(e) = self.publish().await {
                    // Players never saw it, so it goes back in the pool
                    self.store.undo_draw(number);
                    warn!(game_id = %self.game_id(), number, "Draw not published: {}", e);
                    return Err(e.into());
                }
                self.settle_phase();
                info!(game_id = %self.game_id(), number = %number_label(number), "Number drawn");
            }
            DrawOutcome::Paused => debug!(game_id = %self.game_id(), "Draw ignored while paused"),
            DrawOutcome::Exhausted => {
                self.phase = HostPhase::Exhausted;
                debug!(game_id = %self.game_id(), "Draw ignored; all numbers called");
            }
        }
        Ok(outcome)
    }

    /// End the current game and start a new one under a new id.
    ///
    /// Players of the old game first receive a final inactive snapshot; the
    /// old game gets no updates after that.
    pub async fn reset(&mut self) -> SyncResult<GameSnapshot> {
        let previous = self.game_id().clone();
        self.phase = HostPhase::Resetting;
        self.store.deactivate();
        if let Err(e) = self.publish().await {
            warn!(game_id = %previous, "Could not publish end of game: {}", e);
        }

        self.store.reset();
        self.pending.clear();
        let snapshot = self.publish().await?;
        self.settle_phase();
        info!(previous = %previous, game_id = %self.game_id(), "Game reset");
        Ok(snapshot)
    }

    /// Republish unchanged state so players see the host is alive
    pub async fn heartbeat(&mut self) -> SyncResult<Option<GameSnapshot>> {
        if self.phase == HostPhase::Idle {
            return Ok(None);
        }
        self.publish().await.map(Some)
    }

    /// Queue a call for review. Processed and already queued calls are ignored.
    pub fn receive_call(&mut self, key: CallKey, call: BingoCall) -> Option<&CallReview> {
        if call.processed || self.pending.iter().any(|r| r.key == key) {
            return None;
        }
        let review = CallReview::new(key, call, self.store.state().drawn_numbers());
        info!(
            game_id = %self.game_id(),
            player = %review.call.player_name,
            line = %review.call.line,
            undrawn = review.undrawn.len(),
            "Bingo call received"
        );
        self.pending.push(review);
        self.pending.last()
    }

    fn take_pending(&mut self, key: &CallKey) -> Result<CallReview, GameError> {
        let index = self
            .pending
            .iter()
            .position(|r| &r.key == key)
            .ok_or_else(|| GameError::UnknownCall(key.clone()))?;
        Ok(self.pending.remove(index))
    }

    /// Record the caller as a winner, close the call and republish
    pub async fn confirm_call(&mut self, key: &CallKey) -> BingoResult<WinnerRecord> {
        let review = self.take_pending(key)?;
        let record = WinnerRecord {
            player_name: review.call.player_name,
            player_id: review.call.player_id,
            line: review.call.line,
            confirmed_at: Utc::now(),
        };
        self.store.record_winner(record.clone());

        let game_id = self.game_id().clone();
        self.channel.mark_processed(&game_id, key).await?;
        self.channel.announce_winner(&game_id, &record).await?;
        self.publish().await?;

        info!(game_id = %game_id, winner = %record, "Winner confirmed");
        Ok(record)
    }

    /// Close the call without recording a winner
    pub async fn dismiss_call(&mut self, key: &CallKey) -> BingoResult<()> {
        self.take_pending(key)?;
        let game_id = self.game_id().clone();
        self.channel.mark_processed(&game_id, key).await?;
        debug!(game_id = %game_id, call = %key, "Bingo call dismissed");
        Ok(())
    }
}

/// UI requests to a running host
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Draw,
    Reset,
    Confirm(CallKey),
    Dismiss(CallKey),
    Shutdown,
}

/// User-visible notices from a running host
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Started(GameSnapshot),
    Drawn { number: u8, label: String },
    /// Draw refused: a reset is pending
    Paused,
    /// Draw refused: every number has been called
    Exhausted,
    GameReset { previous: GameId, snapshot: GameSnapshot },
    CallReceived(CallReview),
    WinnerConfirmed(WinnerRecord),
    CallDismissed(CallKey),
    TransportChanged(TransportKind),
    Error(String),
}

/// Handle to a host controller running on its own task
pub struct HostSession {
    commands: mpsc::Sender<HostCommand>,
    events: mpsc::UnboundedReceiver<HostEvent>,
    task: JoinHandle<HostController>,
}

impl HostSession {
    /// Start `controller` and run it until shutdown. `transport` reports a
    /// fallback switch, when the channel can degrade.
    pub fn spawn(
        controller: HostController,
        heartbeat: Duration,
        transport: Option<watch::Receiver<TransportKind>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(32);
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_host(controller, heartbeat, transport, command_rx, event_tx));
        Self {
            commands,
            events,
            task,
        }
    }

    pub async fn send(&self, command: HostCommand) -> SyncResult<()> {
        self.commands.send(command).await.map_err(|_| SyncError::Closed)
    }

    pub async fn next_event(&mut self) -> Option<HostEvent> {
        self.events.recv().await
    }

    /// Stop the loop and take the controller back
    pub async fn shutdown(self) -> Option<HostController> {
        let _ = self.commands.send(HostCommand::Shutdown).await;
        self.task.await.ok()
    }
}

async fn open_calls(
    controller: &HostController,
    events: &mpsc::UnboundedSender<HostEvent>,
) -> Option<CallStream> {
    match controller.channel().observe_calls(controller.game_id()).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(game_id = %controller.game_id(), "Cannot observe bingo calls: {}", e);
            let _ = events.send(HostEvent::Error(e.to_string()));
            None
        }
    }
}

async fn run_host(
    mut controller: HostController,
    heartbeat: Duration,
    mut transport: Option<watch::Receiver<TransportKind>>,
    mut commands: mpsc::Receiver<HostCommand>,
    events: mpsc::UnboundedSender<HostEvent>,
) -> HostController {
    let emit = |event: HostEvent| {
        let _ = events.send(event);
    };

    match controller.start().await {
        Ok(snapshot) => emit(HostEvent::Started(snapshot)),
        Err(e) => emit(HostEvent::Error(e.to_string())),
    }

    let mut calls = open_calls(&controller, &events).await;
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    HostCommand::Shutdown => break,
                    HostCommand::Draw => match controller.draw().await {
                        Ok(DrawOutcome::Drawn(number)) => emit(HostEvent::Drawn {
                            number,
                            label: number_label(number),
                        }),
                        Ok(DrawOutcome::Paused) => emit(HostEvent::Paused),
                        Ok(DrawOutcome::Exhausted) => emit(HostEvent::Exhausted),
                        Err(e) => emit(HostEvent::Error(e.to_string())),
                    },
                    HostCommand::Reset => {
                        let previous = controller.game_id().clone();
                        match controller.reset().await {
                            Ok(snapshot) => emit(HostEvent::GameReset { previous, snapshot }),
                            Err(e) => emit(HostEvent::Error(e.to_string())),
                        }
                        // Calls are namespaced by game
                        calls = open_calls(&controller, &events).await;
                    }
                    HostCommand::Confirm(key) => match controller.confirm_call(&key).await {
                        Ok(record) => emit(HostEvent::WinnerConfirmed(record)),
                        Err(e) => emit(HostEvent::Error(e.to_string())),
                    },
                    HostCommand::Dismiss(key) => match controller.dismiss_call(&key).await {
                        Ok(()) => emit(HostEvent::CallDismissed(key)),
                        Err(e) => emit(HostEvent::Error(e.to_string())),
                    },
                }
            }
            delivery = async { calls.as_mut()?.next().await }, if calls.is_some() => {
                match delivery {
                    Some((key, call)) => {
                        if let Some(review) = controller.receive_call(key, call) {
                            emit(HostEvent::CallReceived(review.clone()));
                        }
                    }
                    None => {
                        debug!(game_id = %controller.game_id(), "Call feed closed");
                        calls = None;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = controller.heartbeat().await {
                    warn!(game_id = %controller.game_id(), "Heartbeat failed: {}", e);
                }
            }
            kind = next_transport_change(&mut transport) => {
                emit(HostEvent::TransportChanged(kind));
            }
        }
    }

    info!(game_id = %controller.game_id(), "Host session stopped");
    controller
}
