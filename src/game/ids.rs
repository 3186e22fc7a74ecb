//! Identifier generation for games, hosts and players

use super::types::{CallKey, GameId};
use rand::Rng;

/// No 0/O, 1/I look-alikes
const GAME_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GAME_ID_LEN: usize = 4;

const BASE36: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SUFFIX_LEN: usize = 5;

fn random_string<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

pub fn generate_game_id<R: Rng + ?Sized>(rng: &mut R) -> GameId {
    GameId(random_string(rng, GAME_ID_ALPHABET, GAME_ID_LEN))
}

/// A game id guaranteed to differ from `previous`
pub fn generate_distinct_game_id<R: Rng + ?Sized>(rng: &mut R, previous: &GameId) -> GameId {
    loop {
        let id = generate_game_id(rng);
        if &id != previous {
            return id;
        }
    }
}

pub fn generate_host_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("HOST-{}", random_string(rng, BASE36, SUFFIX_LEN))
}

pub fn generate_player_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("P-{}", random_string(rng, BASE36, SUFFIX_LEN))
}

/// Time-ordered unique key: 13 hex digits of epoch millis, then 12 random hex digits
pub fn generate_call_key(now_ms: u64) -> CallKey {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    CallKey(format!("{:013x}{}", now_ms, &nonce[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_game_id_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let id = generate_game_id(&mut rng);
            assert_eq!(id.as_str().len(), 4);
            assert!(id.as_str().bytes().all(|b| GAME_ID_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_distinct_game_id() {
        let mut rng = StdRng::seed_from_u64(1);
        let first = generate_game_id(&mut rng);
        for _ in 0..50 {
            assert_ne!(generate_distinct_game_id(&mut rng, &first), first);
        }
    }

    #[test]
    fn test_host_and_player_ids() {
        let mut rng = StdRng::seed_from_u64(3);
        let host = generate_host_id(&mut rng);
        let player = generate_player_id(&mut rng);
        assert!(host.starts_with("HOST-") && host.len() == 10);
        assert!(player.starts_with("P-") && player.len() == 7);
    }

    #[test]
    fn test_call_keys_sort_by_time() {
        let a = generate_call_key(1_000);
        let b = generate_call_key(2_000);
        assert!(a < b);
        assert_ne!(generate_call_key(5), generate_call_key(5));
    }
}
