//! In-memory key/value cache cells.

use serde::{Deserialize, Serialize};

use ctxkeeper_core::{KvMemory, Position, SequenceId, Token};

/// One occupied cache cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub token: Token,
    pub position: Position,
    pub sequence: SequenceId,
}

/// Bounded set of cells, kept in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvCache {
    cells: Vec<Cell>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn insert(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Tokens of `sequence` ordered by position.
    pub fn sequence_tokens(&self, sequence: SequenceId) -> Vec<(Position, Token)> {
        let mut tokens: Vec<_> = self
            .cells
            .iter()
            .filter(|c| c.sequence == sequence)
            .map(|c| (c.position, c.token))
            .collect();
        tokens.sort_by_key(|&(position, _)| position);
        tokens
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

fn in_range(position: Position, start: Position, end: Option<Position>) -> bool {
    position >= start && end.map_or(true, |end| position < end)
}

impl KvMemory for KvCache {
    fn remove_range(&mut self, sequence: SequenceId, start: Position, end: Option<Position>) -> bool {
        self.cells
            .retain(|c| c.sequence != sequence || !in_range(c.position, start, end));
        true
    }

    fn shift_positions(
        &mut self,
        sequence: SequenceId,
        start: Position,
        end: Option<Position>,
        delta: Position,
    ) {
        for cell in &mut self.cells {
            if cell.sequence == sequence && in_range(cell.position, start, end) {
                cell.position += delta;
            }
        }
    }

    fn max_position(&self, sequence: SequenceId) -> Option<Position> {
        self.cells
            .iter()
            .filter(|c| c.sequence == sequence)
            .map(|c| c.position)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(sequence: SequenceId, n: Position) -> KvCache {
        let mut cache = KvCache::new();
        for position in 0..n {
            cache.insert(Cell {
                token: position,
                position,
                sequence,
            });
        }
        cache
    }

    #[test]
    fn test_remove_and_shift_closes_gap() {
        let mut cache = cache_with(0, 10);
        cache.remove_range(0, 2, Some(5));
        cache.shift_positions(0, 5, None, -3);

        let positions: Vec<_> = cache.sequence_tokens(0).iter().map(|&(p, _)| p).collect();
        assert_eq!(positions, (0..7).collect::<Vec<_>>());
        assert_eq!(cache.max_position(0), Some(6));
        // Token 5 now sits at position 2.
        assert_eq!(cache.sequence_tokens(0)[2], (2, 5));
    }

    #[test]
    fn test_open_ended_removal() {
        let mut cache = cache_with(0, 10);
        cache.remove_range(0, 4, None);
        assert_eq!(cache.len(), 4);
        cache.remove_range(0, 0, None);
        assert!(cache.is_empty());
        assert_eq!(cache.max_position(0), None);
    }

    #[test]
    fn test_other_sequences_untouched() {
        let mut cache = cache_with(0, 4);
        cache.insert(Cell {
            token: 9,
            position: 1,
            sequence: 1,
        });
        cache.remove_range(0, 0, None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.max_position(1), Some(1));
    }
}
