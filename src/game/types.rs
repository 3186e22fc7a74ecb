use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Highest number in the draw pool
pub const MAX_NUMBER: u8 = 75;

/// Cards are `CARD_SIZE` x `CARD_SIZE`
pub const CARD_SIZE: usize = 5;

/// Row/column of the free space
pub const FREE_CENTER: usize = 2;

const MAX_ID_LEN: usize = 64;

fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Short opaque game identifier, immutable for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GameId(pub(crate) String);

impl GameId {
    /// Accepts ASCII alphanumerics and `-` only, since ids end up in
    /// storage keys and tree paths
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        is_valid_id(&id).then_some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GameId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameId::new(s).ok_or_else(|| format!("invalid game id '{}'", s))
    }
}

impl TryFrom<String> for GameId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GameId> for String {
    fn from(id: GameId) -> Self {
        id.0
    }
}

/// Unique key of one submitted bingo call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallKey(pub(crate) String);

impl CallKey {
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        is_valid_id(&key).then_some(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CallKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        CallKey::new(s.clone()).ok_or_else(|| format!("invalid call key '{}'", s))
    }
}

impl From<CallKey> for String {
    fn from(key: CallKey) -> Self {
        key.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column letters and their number ranges
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Letter {
    B,
    I,
    N,
    G,
    O,
}

impl Letter {
    pub const ALL: [Letter; CARD_SIZE] = [Letter::B, Letter::I, Letter::N, Letter::G, Letter::O];

    /// Column index on the card
    pub fn column(self) -> usize {
        self as usize
    }

    pub fn from_column(col: usize) -> Option<Self> {
        Self::ALL.get(col).copied()
    }

    pub fn range(self) -> RangeInclusive<u8> {
        let low = self.column() as u8 * 15 + 1;
        low..=low + 14
    }

    pub fn for_number(number: u8) -> Option<Self> {
        if number == 0 || number > MAX_NUMBER {
            return None;
        }
        Self::from_column(((number - 1) / 15) as usize)
    }
}

impl fmt::Display for Letter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Letter::B => "B",
            Letter::I => "I",
            Letter::N => "N",
            Letter::G => "G",
            Letter::O => "O",
        };
        f.write_str(s)
    }
}

/// Display label for a called number, e.g. `B 7`
pub fn number_label(number: u8) -> String {
    match Letter::for_number(number) {
        Some(letter) => format!("{} {}", letter, number),
        None => format!("Number {}", number),
    }
}

/// A line a player may declare when calling bingo
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum WinningLine {
    /// Zero-based row index
    Row(u8),
    Column(Letter),
    /// Top-left to bottom-right
    Diagonal,
    /// Top-right to bottom-left
    AntiDiagonal,
    FourCorners,
    Blackout,
}

impl WinningLine {
    pub fn all() -> Vec<WinningLine> {
        let mut lines: Vec<WinningLine> = (0..CARD_SIZE as u8).map(WinningLine::Row).collect();
        lines.extend(Letter::ALL.iter().map(|l| WinningLine::Column(*l)));
        lines.extend([
            WinningLine::Diagonal,
            WinningLine::AntiDiagonal,
            WinningLine::FourCorners,
            WinningLine::Blackout,
        ]);
        lines
    }

    /// `(row, col)` positions covered by the line
    pub fn cells(&self) -> Vec<(usize, usize)> {
        let n = CARD_SIZE;
        match *self {
            WinningLine::Row(r) if (r as usize) < n => (0..n).map(|c| (r as usize, c)).collect(),
            WinningLine::Row(_) => Vec::new(),
            WinningLine::Column(letter) => (0..n).map(|r| (r, letter.column())).collect(),
            WinningLine::Diagonal => (0..n).map(|i| (i, i)).collect(),
            WinningLine::AntiDiagonal => (0..n).map(|i| (i, n - 1 - i)).collect(),
            WinningLine::FourCorners => vec![(0, 0), (0, n - 1), (n - 1, 0), (n - 1, n - 1)],
            WinningLine::Blackout => (0..n).flat_map(|r| (0..n).map(move |c| (r, c))).collect(),
        }
    }
}

impl fmt::Display for WinningLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WinningLine::Row(r) => write!(f, "Row {}", *r as usize + 1),
            WinningLine::Column(letter) => write!(f, "Column {}", letter),
            WinningLine::Diagonal => write!(f, "Diagonal"),
            WinningLine::AntiDiagonal => write!(f, "Anti-diagonal"),
            WinningLine::FourCorners => write!(f, "Four corners"),
            WinningLine::Blackout => write!(f, "Blackout"),
        }
    }
}

/// A confirmed winner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinnerRecord {
    pub player_name: String,
    pub player_id: String,
    pub line: WinningLine,
    pub confirmed_at: DateTime<Utc>,
}

impl fmt::Display for WinnerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ({})",
            self.player_name,
            self.confirmed_at.format("%H:%M:%S"),
            self.line
        )
    }
}

/// A bingo claim in transit from a player to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BingoCall {
    pub player_id: String,
    pub player_name: String,
    pub line: WinningLine,
    pub timestamp: DateTime<Utc>,
    /// Numbers the player had marked; the free space is implied
    pub marked_numbers: Vec<u8>,
    #[serde(default)]
    pub processed: bool,
}

impl BingoCall {
    /// Marked cells including the free space
    pub fn marked_count(&self) -> usize {
        self.marked_numbers.len() + 1
    }
}

/// Presence entry for a connected player
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub player_id: String,
    pub player_name: String,
    pub joined_at: DateTime<Utc>,
}

/// What players see of the host state. Every publish is a total replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub game_id: GameId,
    pub host_id: String,
    pub current_number: Option<u8>,
    /// Most recent first
    pub drawn_numbers: Vec<u8>,
    pub total_drawn: usize,
    pub active: bool,
    #[serde(default)]
    pub winners: Vec<WinnerRecord>,
    /// Epoch millis of the publish; heartbeats only move this
    pub last_update: u64,
}

impl GameSnapshot {
    /// Equal in everything except the publish timestamp
    pub fn same_content(&self, other: &GameSnapshot) -> bool {
        self.game_id == other.game_id
            && self.host_id == other.host_id
            && self.current_number == other.current_number
            && self.drawn_numbers == other.drawn_numbers
            && self.active == other.active
            && self.winners == other.winners
    }
}
