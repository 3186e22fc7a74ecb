//! Storage key and tree path naming for both transports.
//!
//! Local keys are flat strings namespaced by game id. Remote paths are
//! `/`-separated segments in the real-time tree.

use crate::errors::{SyncError, SyncResult};
use crate::game::types::{CallKey, GameId};

pub mod local {
    use super::*;

    pub fn state(game: &GameId) -> String {
        format!("bingo_{}", game)
    }

    pub fn current_number(game: &GameId) -> String {
        format!("bingo_current_{}", game)
    }

    pub fn drawn_numbers(game: &GameId) -> String {
        format!("bingo_drawn_{}", game)
    }

    pub fn last_update(game: &GameId) -> String {
        format!("bingo_last_update_{}", game)
    }

    pub fn winners(game: &GameId) -> String {
        format!("bingo_winners_{}", game)
    }

    pub fn call_prefix(game: &GameId) -> String {
        format!("bingo_call_{}_", game)
    }

    pub fn call(game: &GameId, key: &CallKey) -> String {
        format!("{}{}", call_prefix(game), key)
    }

    pub fn presence(game: &GameId, player_id: &str) -> String {
        format!("bingo_player_{}_{}", game, player_id)
    }

    /// Written in place of a number when nothing has been drawn
    pub const NO_NUMBER: &str = "--";
}

pub mod remote {
    use super::*;

    pub const CONNECTION_TEST: &str = "connectionTest";

    pub fn game(game: &GameId) -> String {
        format!("games/{}", game)
    }

    pub fn current(game: &GameId) -> String {
        format!("current/{}", game)
    }

    pub fn presence(game: &GameId, player_id: &str) -> String {
        format!("players/{}/{}", game, player_id)
    }

    pub fn calls(game: &GameId) -> String {
        format!("bingoCalls/{}", game)
    }

    pub fn call_processed(game: &GameId, key: &CallKey) -> String {
        format!("bingoCalls/{}/{}/processed", game, key)
    }

    pub fn winners(game: &GameId) -> String {
        format!("winners/{}", game)
    }
}

/// Split a tree path into segments. The empty path is the root.
pub fn path_segments(path: &str) -> SyncResult<Vec<String>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split('/')
        .map(|segment| {
            let forbidden = |c: char| matches!(c, '.' | '#' | '$' | '[' | ']') || c.is_control();
            if segment.is_empty() || segment.chars().any(forbidden) {
                Err(SyncError::InvalidPath(path.to_string()))
            } else {
                Ok(segment.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_keys_are_namespaced() {
        let a = GameId::new("AAAA").unwrap();
        let b = GameId::new("BBBB").unwrap();
        assert_ne!(local::current_number(&a), local::current_number(&b));
        assert!(local::call(&a, &CallKey::new("k1").unwrap()).starts_with(&local::call_prefix(&a)));
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("games/ABCD").unwrap(), vec!["games", "ABCD"]);
        assert_eq!(path_segments("/current/X/").unwrap(), vec!["current", "X"]);
        assert!(path_segments("").unwrap().is_empty());
        assert!(path_segments("a//b").is_err());
        assert!(path_segments("a/b.c").is_err());
    }

    #[test]
    fn test_remote_paths() {
        let g = GameId::new("K7QZ").unwrap();
        let k = CallKey::new("0001").unwrap();
        assert_eq!(remote::call_processed(&g, &k), "bingoCalls/K7QZ/0001/processed");
        assert!(path_segments(&remote::presence(&g, "P-ABCDE")).is_ok());
    }
}
