//! Translation from cell addresses to rendered grid coordinates.

use std::collections::HashMap;
use tally_core::{ColumnKey, EntityId};

/// Entity id to row position and column key to column position.
///
/// Rebuilt synchronously after every change to the row or column set. An
/// address that was not part of the last rebuild resolves to `None` instead
/// of a stale coordinate.
#[derive(Debug, Default, Clone)]
pub struct LookupIndex {
    rows: HashMap<EntityId, usize>,
    columns: HashMap<ColumnKey, usize>,
    generation: u64,
}

impl LookupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the rows and columns in render order.
    pub fn build<'a>(
        rows: impl IntoIterator<Item = EntityId>,
        columns: impl IntoIterator<Item = &'a ColumnKey>,
    ) -> Self {
        let mut index = Self::new();
        index.rebuild(rows, columns);
        index
    }

    /// Replace both maps with a single scan of the current layout.
    pub fn rebuild<'a>(
        &mut self,
        rows: impl IntoIterator<Item = EntityId>,
        columns: impl IntoIterator<Item = &'a ColumnKey>,
    ) {
        self.rows.clear();
        self.columns.clear();
        for (position, id) in rows.into_iter().enumerate() {
            self.rows.entry(id).or_insert(position);
        }
        for (position, column) in columns.into_iter().enumerate() {
            self.columns.entry(column.clone()).or_insert(position);
        }
        self.generation += 1;
    }

    /// `(row, column)` of the cell, if both halves are currently rendered.
    pub fn resolve(&self, entity_id: EntityId, column: &ColumnKey) -> Option<(usize, usize)> {
        let row = self.rows.get(&entity_id)?;
        let col = self.columns.get(column)?;
        Some((*row, *col))
    }

    pub fn row_of(&self, entity_id: EntityId) -> Option<usize> {
        self.rows.get(&entity_id).copied()
    }

    pub fn column_of(&self, column: &ColumnKey) -> Option<usize> {
        self.columns.get(column).copied()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
