pub mod card;
pub mod ids;
pub mod store;
pub mod types;

pub use card::{Cell, PlayerCard};
pub use store::{DrawOutcome, GameState, GameStateStore};
pub use types::*;
