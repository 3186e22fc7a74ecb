//! Player entry URL: the game id travels as the `game` query parameter.

use crate::errors::ConfigurationError;
use crate::game::GameId;
use url::Url;

const PLAYER_PAGE: &str = "player.html";
const GAME_PARAM: &str = "game";

/// `{base}player.html?game={id}`
pub fn player_url(base: &str, game_id: &GameId) -> Result<Url, ConfigurationError> {
    let mut url = Url::parse(base)?.join(PLAYER_PAGE)?;
    url.query_pairs_mut()
        .clear()
        .append_pair(GAME_PARAM, game_id.as_str());
    Ok(url)
}

/// Game id from an entry URL. A missing parameter, an invalid id or an
/// unparseable URL all give `fallback`.
pub fn game_id_from_url(url: &str, fallback: &GameId) -> GameId {
    Url::parse(url)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == GAME_PARAM)
                .and_then(|(_, value)| GameId::new(value.trim()))
        })
        .unwrap_or_else(|| fallback.clone())
}
