//! bingo-sync - host/player state synchronization for multiplayer bingo
//!
//! One host draws numbers and confirms winners; any number of players follow
//! along, mark their own cards and call bingo. Everything travels through a
//! [`sync::SyncChannel`]: shared local storage on a single device, or a
//! real-time JSON tree served by the `bingo-relay` binary for multi-device
//! play, with automatic fallback from the latter to the former.

pub mod clock;
pub mod config;
pub mod errors;
pub mod game;
pub mod host;
pub mod link;
pub mod logging;
pub mod player;
pub mod relay;
pub mod sync;

pub use config::{BingoConfig, ConfigLoader};
pub use errors::{BingoError, BingoResult, SyncError, SyncResult};
pub use game::{
    BingoCall, CallKey, DrawOutcome, GameId, GameSnapshot, GameState, GameStateStore, PlayerCard,
    WinnerRecord, WinningLine,
};
pub use host::{CallReview, HostCommand, HostController, HostEvent, HostPhase, HostSession};
pub use player::{PlayerCommand, PlayerController, PlayerEvent, PlayerSession, PlayerSettings};
pub use sync::{select_channel, LinkState, SyncChannel, TransportKind};
