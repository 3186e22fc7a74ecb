//! A player's 5x5 card and its marks. Cards never leave the player.

use super::types::{Letter, WinningLine, CARD_SIZE, FREE_CENTER};
use crate::errors::PlayerError;
use rand::{seq::index::sample, Rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Number(u8),
    /// Centre cell, always marked
    Free,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerCard {
    /// `cells[row][col]`
    cells: [[Cell; CARD_SIZE]; CARD_SIZE],
    marked: BTreeSet<u8>,
}

impl PlayerCard {
    /// Five distinct numbers per column from the column's range, ascending
    /// top to bottom, with the centre replaced by the free space
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut cells = [[Cell::Free; CARD_SIZE]; CARD_SIZE];

        for letter in Letter::ALL {
            let low = *letter.range().start();
            let span = letter.range().len();
            let mut numbers: Vec<u8> = sample(rng, span, CARD_SIZE)
                .into_iter()
                .map(|i| low + i as u8)
                .collect();
            numbers.sort_unstable();

            for (row, number) in numbers.into_iter().enumerate() {
                cells[row][letter.column()] = Cell::Number(number);
            }
        }
        cells[FREE_CENTER][FREE_CENTER] = Cell::Free;

        Self {
            cells,
            marked: BTreeSet::new(),
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<Cell> {
        self.cells.get(row).and_then(|r| r.get(col)).copied()
    }

    pub fn rows(&self) -> &[[Cell; CARD_SIZE]; CARD_SIZE] {
        &self.cells
    }

    /// Numeric cells of one column, top to bottom
    pub fn column(&self, letter: Letter) -> Vec<u8> {
        self.cells
            .iter()
            .filter_map(|row| match row[letter.column()] {
                Cell::Number(n) => Some(n),
                Cell::Free => None,
            })
            .collect()
    }

    pub fn contains(&self, number: u8) -> bool {
        self.cells
            .iter()
            .flatten()
            .any(|cell| *cell == Cell::Number(number))
    }

    pub fn is_marked(&self, number: u8) -> bool {
        self.marked.contains(&number)
    }

    fn is_cell_marked(&self, row: usize, col: usize) -> bool {
        match self.cells[row][col] {
            Cell::Free => true,
            Cell::Number(n) => self.marked.contains(&n),
        }
    }

    /// Mark a called number if it is on the card. Returns true only when
    /// the mark is new.
    pub fn mark(&mut self, number: u8) -> bool {
        self.contains(number) && self.marked.insert(number)
    }

    /// Flip a cell's mark. Returns whether the cell is marked afterwards.
    pub fn toggle(&mut self, number: u8) -> Result<bool, PlayerError> {
        if !self.contains(number) {
            return Err(PlayerError::NotOnCard(number));
        }
        if self.marked.remove(&number) {
            Ok(false)
        } else {
            self.marked.insert(number);
            Ok(true)
        }
    }

    /// Marked numbers, ascending; the free space is not a number
    pub fn marked_numbers(&self) -> Vec<u8> {
        self.marked.iter().copied().collect()
    }

    /// Marked cells including the free space
    pub fn marked_count(&self) -> usize {
        self.marked.len() + 1
    }

    pub fn is_complete(&self, line: WinningLine) -> bool {
        let cells = line.cells();
        !cells.is_empty() && cells.into_iter().all(|(r, c)| self.is_cell_marked(r, c))
    }

    pub fn completed_lines(&self) -> Vec<WinningLine> {
        WinningLine::all()
            .into_iter()
            .filter(|line| self.is_complete(*line))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_card_layout() {
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..200 {
            let card = PlayerCard::generate(&mut rng);
            assert_eq!(card.cell(FREE_CENTER, FREE_CENTER), Some(Cell::Free));

            for letter in Letter::ALL {
                let column = card.column(letter);
                let expected = if letter == Letter::N { 4 } else { 5 };
                assert_eq!(column.len(), expected);
                assert!(column.iter().all(|n| letter.range().contains(n)));
                let unique: HashSet<_> = column.iter().collect();
                assert_eq!(unique.len(), column.len());
                assert!(column.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn test_free_space_counts_as_marked() {
        let mut rng = StdRng::seed_from_u64(1);
        let card = PlayerCard::generate(&mut rng);
        assert_eq!(card.marked_count(), 1);
        assert!(card.marked_numbers().is_empty());
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut card = PlayerCard::generate(&mut rng);
        let number = card.column(Letter::B)[0];

        assert!(card.mark(number));
        assert!(!card.mark(number));
        assert_eq!(card.marked_count(), 2);
    }

    #[test]
    fn test_mark_ignores_numbers_off_card() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut card = PlayerCard::generate(&mut rng);
        let off_card = (1..=75).find(|n| !card.contains(*n)).unwrap();
        assert!(!card.mark(off_card));
        assert!(matches!(card.toggle(off_card), Err(PlayerError::NotOnCard(_))));
    }

    #[test]
    fn test_toggle_flips() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut card = PlayerCard::generate(&mut rng);
        let number = card.column(Letter::O)[3];

        assert!(card.toggle(number).unwrap());
        assert!(card.is_marked(number));
        assert!(!card.toggle(number).unwrap());
        assert!(!card.is_marked(number));
    }

    #[test]
    fn test_line_completion() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut card = PlayerCard::generate(&mut rng);
        assert!(card.completed_lines().is_empty());

        // Middle row has the free space, so four marks complete it
        for col in 0..CARD_SIZE {
            if let Some(Cell::Number(n)) = card.cell(FREE_CENTER, col) {
                card.mark(n);
            }
        }
        assert!(card.is_complete(WinningLine::Row(FREE_CENTER as u8)));
        assert_eq!(card.completed_lines(), vec![WinningLine::Row(2)]);
        assert!(!card.is_complete(WinningLine::Row(9)));
    }

    #[test]
    fn test_new_card_has_no_marks() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut card = PlayerCard::generate(&mut rng);
        for n in card.column(Letter::G) {
            card.mark(n);
        }
        let fresh = PlayerCard::generate(&mut rng);
        assert_eq!(fresh.marked_count(), 1);
    }
}
