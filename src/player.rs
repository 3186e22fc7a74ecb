//! Player side: observes the host, marks its own card, calls bingo.

use crate::clock::now_millis;
use crate::config::BingoConfig;
use crate::errors::{BingoResult, PlayerError, SyncError, SyncResult};
use crate::game::{
    number_label, BingoCall, CallKey, Cell, GameId, GameSnapshot, PlayerCard, Presence,
    WinnerRecord, WinningLine,
};
use crate::sync::{
    next_transport_change, LinkState, Liveness, SnapshotStream, SyncChannel, TransportKind,
};
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Tunables taken from [`BingoConfig`]
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub min_marks_for_call: usize,
    pub history_len: usize,
    pub staleness_window: Duration,
    /// How often a session re-checks host liveness
    pub liveness_check: Duration,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self::from_config(&BingoConfig::default())
    }
}

impl PlayerSettings {
    pub fn from_config(config: &BingoConfig) -> Self {
        Self {
            min_marks_for_call: config.player.min_marks_for_call,
            history_len: config.player.history_len,
            staleness_window: config.sync.staleness_window(),
            liveness_check: config.sync.poll_interval(),
        }
    }
}

/// What changed when a snapshot was applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotUpdate {
    pub link: Option<LinkState>,
    /// Set only when the current number differs from the last one seen
    pub new_number: Option<u8>,
    pub auto_marked: bool,
    /// The host ended this game
    pub game_ended: bool,
    /// Winners list grew
    pub new_winners: Vec<WinnerRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub number: u8,
    pub label: String,
    pub on_card: bool,
}

pub struct PlayerController {
    channel: Arc<dyn SyncChannel>,
    game_id: GameId,
    player_id: String,
    player_name: String,
    settings: PlayerSettings,
    card: PlayerCard,
    rng: StdRng,
    liveness: Liveness,
    last_seen_number: Option<u8>,
    snapshot: Option<GameSnapshot>,
}

impl PlayerController {
    pub fn new(
        channel: Arc<dyn SyncChannel>,
        game_id: GameId,
        player_name: String,
        settings: PlayerSettings,
    ) -> Self {
        Self::with_rng(channel, game_id, player_name, settings, StdRng::from_entropy())
    }

    pub fn with_rng(
        channel: Arc<dyn SyncChannel>,
        game_id: GameId,
        player_name: String,
        settings: PlayerSettings,
        mut rng: StdRng,
    ) -> Self {
        let player_id = crate::game::ids::generate_player_id(&mut rng);
        let card = PlayerCard::generate(&mut rng);
        let liveness = Liveness::new(settings.staleness_window, now_millis());
        Self {
            channel,
            game_id,
            player_id,
            player_name,
            settings,
            card,
            rng,
            liveness,
            last_seen_number: None,
            snapshot: None,
        }
    }

    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn card(&self) -> &PlayerCard {
        &self.card
    }

    pub fn link_state(&self) -> LinkState {
        self.liveness.state()
    }

    pub fn snapshot(&self) -> Option<&GameSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn current_number(&self) -> Option<u8> {
        self.last_seen_number
    }

    pub fn channel(&self) -> &Arc<dyn SyncChannel> {
        &self.channel
    }

    /// React to a delivery from the host. Snapshots of other games are ignored.
    pub fn apply_snapshot(&mut self, snapshot: GameSnapshot, now_ms: u64) -> SnapshotUpdate {
        let mut update = SnapshotUpdate::default();
        if snapshot.game_id != self.game_id {
            debug!(
                expected = %self.game_id,
                got = %snapshot.game_id,
                "Ignoring snapshot for another game"
            );
            return update;
        }

        update.link = self.liveness.observe(snapshot.last_update, now_ms);

        if snapshot.current_number != self.last_seen_number {
            self.last_seen_number = snapshot.current_number;
            update.new_number = snapshot.current_number;
            if let Some(number) = snapshot.current_number {
                update.auto_marked = self.card.mark(number);
            }
        }

        let (was_active, known_winners) = match &self.snapshot {
            Some(previous) => (previous.active, previous.winners.len()),
            None => (true, 0),
        };
        update.game_ended = was_active && !snapshot.active;
        update.new_winners = snapshot.winners.iter().skip(known_winners).cloned().collect();

        self.snapshot = Some(snapshot);
        update
    }

    /// Re-evaluate host liveness; returns the new state on a transition
    pub fn check_liveness(&mut self, now_ms: u64) -> Option<LinkState> {
        self.liveness.check(now_ms)
    }

    /// Flip any numeric cell, called or not
    pub fn toggle_mark(&mut self, number: u8) -> Result<bool, PlayerError> {
        self.card.toggle(number)
    }

    pub fn toggle_cell(&mut self, row: usize, col: usize) -> Result<bool, PlayerError> {
        match self.card.cell(row, col) {
            Some(Cell::Number(number)) => self.card.toggle(number),
            Some(Cell::Free) => Err(PlayerError::FreeSpace),
            None => Err(PlayerError::NoSuchCell { row, col }),
        }
    }

    /// Replace the card; every mark goes with it
    pub fn new_card(&mut self) {
        self.card = PlayerCard::generate(&mut self.rng);
    }

    /// Whether a bingo call would be accepted right now
    pub fn can_call(&self) -> Result<(), PlayerError> {
        let marked = self.card.marked_count();
        if marked < self.settings.min_marks_for_call {
            return Err(PlayerError::NotEnoughMarks {
                marked,
                required: self.settings.min_marks_for_call,
            });
        }
        let remote = self.channel.kind() == TransportKind::Remote;
        if remote && self.liveness.state() != LinkState::Connected {
            return Err(PlayerError::HostDisconnected);
        }
        Ok(())
    }

    pub async fn submit_call(&mut self, line: WinningLine) -> BingoResult<CallKey> {
        self.can_call()?;
        let call = BingoCall {
            player_id: self.player_id.clone(),
            player_name: self.player_name.clone(),
            line,
            timestamp: Utc::now(),
            marked_numbers: self.card.marked_numbers(),
            processed: false,
        };
        let key = self.channel.submit_call(&self.game_id, &call).await?;
        info!(game_id = %self.game_id, player = %self.player_name, line = %line, "Bingo called");
        Ok(key)
    }

    pub async fn join(&self) -> SyncResult<()> {
        let presence = Presence {
            player_id: self.player_id.clone(),
            player_name: self.player_name.clone(),
            joined_at: Utc::now(),
        };
        self.channel.join(&self.game_id, &presence).await
    }

    pub async fn leave(&self) -> SyncResult<()> {
        self.channel.leave(&self.game_id, &self.player_id).await
    }

    /// Follow another game. Everything learned about the old one is dropped;
    /// the card and its marks stay.
    pub fn switch_game(&mut self, game_id: GameId, now_ms: u64) {
        info!(from = %self.game_id, to = %game_id, "Switching game");
        self.game_id = game_id;
        self.snapshot = None;
        self.last_seen_number = None;
        self.liveness.restart(now_ms);
    }

    /// Full draw history, most recent first
    pub fn drawn_numbers(&self) -> &[u8] {
        self.snapshot
            .as_ref()
            .map(|s| s.drawn_numbers.as_slice())
            .unwrap_or(&[])
    }

    /// Most recent draws, newest first, flagged when on this card
    pub fn recent_history(&self) -> Vec<HistoryEntry> {
        self.drawn_numbers()
            .iter()
            .take(self.settings.history_len)
            .map(|&number| HistoryEntry {
                number,
                label: number_label(number),
                on_card: self.card.contains(number),
            })
            .collect()
    }
}

/// UI requests to a running player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Toggle(u8),
    NewCard,
    CallBingo(WinningLine),
    SwitchGame(GameId),
    Shutdown,
}

/// User-visible notices from a running player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    LinkChanged(LinkState),
    NumberCalled {
        number: u8,
        label: String,
        auto_marked: bool,
    },
    GameEnded,
    WinnerAnnounced(WinnerRecord),
    Marked { number: u8, marked: bool },
    NewCard,
    CallSubmitted(CallKey),
    CallRejected(String),
    TransportChanged(TransportKind),
    Error(String),
}

/// Handle to a player controller running on its own task
pub struct PlayerSession {
    commands: mpsc::Sender<PlayerCommand>,
    events: mpsc::UnboundedReceiver<PlayerEvent>,
    task: JoinHandle<PlayerController>,
}

impl PlayerSession {
    pub fn spawn(
        controller: PlayerController,
        transport: Option<watch::Receiver<TransportKind>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(32);
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_player(controller, transport, command_rx, event_tx));
        Self {
            commands,
            events,
            task,
        }
    }

    pub async fn send(&self, command: PlayerCommand) -> SyncResult<()> {
        self.commands.send(command).await.map_err(|_| SyncError::Closed)
    }

    pub async fn next_event(&mut self) -> Option<PlayerEvent> {
        self.events.recv().await
    }

    /// Leave the game and take the controller back
    pub async fn shutdown(self) -> Option<PlayerController> {
        let _ = self.commands.send(PlayerCommand::Shutdown).await;
        self.task.await.ok()
    }
}

async fn open_snapshots(
    controller: &PlayerController,
    events: &mpsc::UnboundedSender<PlayerEvent>,
) -> Option<SnapshotStream> {
    match controller.channel().subscribe(controller.game_id()).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(game_id = %controller.game_id(), "Cannot subscribe to game: {}", e);
            let _ = events.send(PlayerEvent::Error(e.to_string()));
            None
        }
    }
}

async fn run_player(
    mut controller: PlayerController,
    mut transport: Option<watch::Receiver<TransportKind>>,
    mut commands: mpsc::Receiver<PlayerCommand>,
    events: mpsc::UnboundedSender<PlayerEvent>,
) -> PlayerController {
    let emit = |event: PlayerEvent| {
        let _ = events.send(event);
    };

    if let Err(e) = controller.join().await {
        warn!(game_id = %controller.game_id(), "Could not announce presence: {}", e);
    }
    let mut snapshots = open_snapshots(&controller, &events).await;
    let mut ticker = interval(controller.settings.liveness_check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    PlayerCommand::Shutdown => break,
                    PlayerCommand::Toggle(number) => match controller.toggle_mark(number) {
                        Ok(marked) => emit(PlayerEvent::Marked { number, marked }),
                        Err(e) => emit(PlayerEvent::Error(e.to_string())),
                    },
                    PlayerCommand::NewCard => {
                        controller.new_card();
                        emit(PlayerEvent::NewCard);
                    }
                    PlayerCommand::CallBingo(line) => match controller.submit_call(line).await {
                        Ok(key) => emit(PlayerEvent::CallSubmitted(key)),
                        Err(e) => emit(PlayerEvent::CallRejected(e.to_string())),
                    },
                    PlayerCommand::SwitchGame(game_id) => {
                        if let Err(e) = controller.leave().await {
                            debug!("Could not withdraw presence: {}", e);
                        }
                        controller.switch_game(game_id, now_millis());
                        if let Err(e) = controller.join().await {
                            warn!(
                                game_id = %controller.game_id(),
                                "Could not announce presence: {}", e
                            );
                        }
                        snapshots = open_snapshots(&controller, &events).await;
                    }
                }
            }
            delivery = async { snapshots.as_mut()?.next().await }, if snapshots.is_some() => {
                let Some(snapshot) = delivery else {
                    debug!(game_id = %controller.game_id(), "Snapshot feed closed");
                    snapshots = None;
                    continue;
                };
                let update = controller.apply_snapshot(snapshot, now_millis());
                if let Some(link) = update.link {
                    emit(PlayerEvent::LinkChanged(link));
                }
                if let Some(number) = update.new_number {
                    emit(PlayerEvent::NumberCalled {
                        number,
                        label: number_label(number),
                        auto_marked: update.auto_marked,
                    });
                }
                for winner in update.new_winners {
                    emit(PlayerEvent::WinnerAnnounced(winner));
                }
                if update.game_ended {
                    emit(PlayerEvent::GameEnded);
                }
            }
            _ = ticker.tick() => {
                if let Some(link) = controller.check_liveness(now_millis()) {
                    if link == LinkState::Disconnected {
                        warn!(game_id = %controller.game_id(), "Host not responding");
                    }
                    emit(PlayerEvent::LinkChanged(link));
                }
            }
            kind = next_transport_change(&mut transport) => {
                emit(PlayerEvent::TransportChanged(kind));
            }
        }
    }

    if let Err(e) = controller.leave().await {
        debug!("Could not withdraw presence: {}", e);
    }
    info!(
        game_id = %controller.game_id(),
        player = %controller.player_name(),
        "Player session stopped"
    );
    controller
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameState, GameStateStore, Letter};
    use crate::sync::{LocalChannel, MemoryDatabase, MemoryStorage, RemoteChannel};

    const WINDOW: Duration = Duration::from_secs(10);

    fn settings() -> PlayerSettings {
        PlayerSettings {
            min_marks_for_call: 5,
            history_len: 10,
            staleness_window: WINDOW,
            liveness_check: Duration::from_millis(10),
        }
    }

    fn local_channel() -> Arc<dyn SyncChannel> {
        Arc::new(LocalChannel::new(
            Arc::new(MemoryStorage::new()),
            Duration::from_millis(10),
        ))
    }

    fn player(channel: Arc<dyn SyncChannel>, seed: u64) -> PlayerController {
        PlayerController::with_rng(
            channel,
            GameId::new("ABCD").unwrap(),
            "Ada".to_string(),
            settings(),
            StdRng::seed_from_u64(seed),
        )
    }

    fn snapshot(drawn: &[u8], active: bool) -> GameSnapshot {
        let state = GameState::fresh(GameId::new("ABCD").unwrap(), "HOST-1".to_string());
        let mut store = GameStateStore::from_state(state, StdRng::seed_from_u64(0));
        if !active {
            store.deactivate();
        }
        let mut snapshot = store.state().snapshot(now_millis());
        snapshot.drawn_numbers = drawn.to_vec();
        snapshot.current_number = drawn.first().copied();
        snapshot.total_drawn = drawn.len();
        snapshot
    }

    fn off_card(player: &PlayerController) -> u8 {
        (1..=75).find(|n| !player.card().contains(*n)).unwrap()
    }

    #[test]
    fn test_auto_mark_on_card_number() {
        let mut p = player(local_channel(), 1);
        let number = p.card().column(Letter::B)[0];

        let update = p.apply_snapshot(snapshot(&[number], true), 1_000);
        assert_eq!(update.link, Some(LinkState::Connected));
        assert_eq!(update.new_number, Some(number));
        assert!(update.auto_marked);
        assert_eq!(p.card().marked_count(), 2);
    }

    #[test]
    fn test_auto_mark_is_idempotent() {
        let mut p = player(local_channel(), 2);
        let number = p.card().column(Letter::G)[1];

        p.apply_snapshot(snapshot(&[number], true), 1_000);
        let marks = p.card().marked_numbers();
        let update = p.apply_snapshot(snapshot(&[number], true), 2_000);
        assert_eq!(update.new_number, None);
        assert_eq!(p.card().marked_numbers(), marks);
    }

    #[test]
    fn test_manual_unmark_survives_heartbeat() {
        let mut p = player(local_channel(), 3);
        let number = p.card().column(Letter::I)[2];
        p.apply_snapshot(snapshot(&[number], true), 1_000);
        assert!(!p.toggle_mark(number).unwrap());

        p.apply_snapshot(snapshot(&[number], true), 4_000);
        assert!(!p.card().is_marked(number));
    }

    #[test]
    fn test_off_card_number_changes_nothing() {
        let mut p = player(local_channel(), 4);
        let number = off_card(&p);
        let update = p.apply_snapshot(snapshot(&[number], true), 1_000);
        assert_eq!(update.new_number, Some(number));
        assert!(!update.auto_marked);
        assert_eq!(p.card().marked_count(), 1);
    }

    #[test]
    fn test_other_game_snapshots_ignored() {
        let mut p = player(local_channel(), 5);
        let mut other = snapshot(&[7], true);
        other.game_id = GameId::new("WXYZ").unwrap();
        assert_eq!(p.apply_snapshot(other, 1_000), SnapshotUpdate::default());
        assert_eq!(p.link_state(), LinkState::Connecting);
    }

    #[test]
    fn test_game_end_reported_once() {
        let mut p = player(local_channel(), 6);
        p.apply_snapshot(snapshot(&[], true), 1_000);
        assert!(p.apply_snapshot(snapshot(&[], false), 2_000).game_ended);
        assert!(!p.apply_snapshot(snapshot(&[], false), 3_000).game_ended);
    }

    #[test]
    fn test_staleness_and_recovery() {
        let mut p = player(local_channel(), 7);
        let mut first = snapshot(&[], true);
        first.last_update = 1_000;
        p.apply_snapshot(first.clone(), 1_000);
        assert_eq!(p.check_liveness(11_001), Some(LinkState::Disconnected));

        // The same stamp again is not a sign of life
        assert_eq!(p.apply_snapshot(first, 11_500).link, None);

        let mut heartbeat = snapshot(&[], true);
        heartbeat.last_update = 12_000;
        let update = p.apply_snapshot(heartbeat, 12_000);
        assert_eq!(update.link, Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_long_silent_host_blocks_remote_call() {
        let db = MemoryDatabase::new();
        let channel: Arc<dyn SyncChannel> = Arc::new(RemoteChannel::new(Arc::new(db.connect())));
        let mut p = player(channel, 14);
        for n in p.card().column(Letter::B) {
            p.toggle_mark(n).unwrap();
        }

        let now = now_millis();
        let mut abandoned = snapshot(&[], true);
        abandoned.last_update = now - 3_600_000;
        let update = p.apply_snapshot(abandoned, now);
        assert_eq!(update.link, Some(LinkState::Disconnected));
        assert!(matches!(p.can_call(), Err(PlayerError::HostDisconnected)));

        // Host comes back with a new stamp
        let update = p.apply_snapshot(snapshot(&[], true), now_millis());
        assert_eq!(update.link, Some(LinkState::Connected));
        assert!(p.can_call().is_ok());
    }

    #[tokio::test]
    async fn test_call_gating_at_five_marks() {
        let mut p = player(local_channel(), 8);
        let numbers = p.card().column(Letter::O);

        for &n in &numbers[..3] {
            p.toggle_mark(n).unwrap();
        }
        // Free space plus three
        assert!(matches!(
            p.submit_call(WinningLine::Column(Letter::O)).await,
            Err(crate::errors::BingoError::Player(PlayerError::NotEnoughMarks {
                marked: 4,
                required: 5
            }))
        ));

        p.toggle_mark(numbers[3]).unwrap();
        assert!(p.submit_call(WinningLine::Column(Letter::O)).await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_call_requires_connected_host() {
        let db = MemoryDatabase::new();
        let channel: Arc<dyn SyncChannel> = Arc::new(RemoteChannel::new(Arc::new(db.connect())));
        let mut p = player(channel, 9);
        for n in p.card().column(Letter::B) {
            p.toggle_mark(n).unwrap();
        }
        assert!(matches!(p.can_call(), Err(PlayerError::HostDisconnected)));

        p.apply_snapshot(snapshot(&[], true), now_millis());
        assert!(p.can_call().is_ok());
    }

    #[test]
    fn test_new_card_clears_marks() {
        let mut p = player(local_channel(), 10);
        for n in p.card().column(Letter::N) {
            p.toggle_mark(n).unwrap();
        }
        p.new_card();
        assert_eq!(p.card().marked_count(), 1);
    }

    #[test]
    fn test_free_space_cannot_toggle() {
        let mut p = player(local_channel(), 11);
        assert!(matches!(p.toggle_cell(2, 2), Err(PlayerError::FreeSpace)));
        assert!(p.toggle_cell(0, 0).unwrap());
    }

    #[test]
    fn test_recent_history() {
        let mut p = player(local_channel(), 12);
        let on_card = p.card().column(Letter::B)[0];
        let drawn: Vec<u8> = std::iter::once(on_card)
            .chain((1..=75).filter(|n| *n != on_card).take(14))
            .collect();
        p.apply_snapshot(snapshot(&drawn, true), 1_000);

        let history = p.recent_history();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].number, on_card);
        assert!(history[0].on_card);
        assert_eq!(history[0].label, number_label(on_card));
        assert_eq!(p.drawn_numbers().len(), 15);
    }

    #[test]
    fn test_switch_game_restarts_link() {
        let mut p = player(local_channel(), 13);
        p.apply_snapshot(snapshot(&[3], true), 1_000);
        p.switch_game(GameId::new("NEW1").unwrap(), 2_000);
        assert_eq!(p.link_state(), LinkState::Connecting);
        assert_eq!(p.current_number(), None);
        assert!(p.drawn_numbers().is_empty());
    }
}
