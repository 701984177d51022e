//! Client-side grid model.
//!
//! Values are plain overwrites, so applying the same update twice leaves
//! the same state as applying it once. Each `apply_batch` is one atomic
//! mutation and bumps `revision` once, which is what a renderer redraws on.

use crate::lookup::LookupIndex;
use tally_core::{CellChange, CellValue, ColumnKey, Entity, EntityId, EntityKind, FieldKey, GridSnapshot};
use tracing::debug;

/// Result of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The cell already held this value.
    Unchanged,
    /// Row or column is not rendered; the update is dropped.
    NotFound,
}

/// Counts for one atomic batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchApply {
    pub applied: usize,
    pub unchanged: usize,
    pub missed: usize,
}

impl BatchApply {
    pub fn total(&self) -> usize {
        self.applied + self.unchanged + self.missed
    }

    pub fn merge(&mut self, other: BatchApply) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.missed += other.missed;
    }
}

#[derive(Debug, Default, Clone)]
pub struct Grid {
    rows: Vec<Entity>,
    columns: Vec<ColumnKey>,
    cells: Vec<Vec<CellValue>>,
    index: LookupIndex,
    revision: u64,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: GridSnapshot) -> Self {
        let mut grid = Self::new();
        grid.load(snapshot);
        grid
    }

    /// Replace the whole grid (initial load or full refresh).
    pub fn load(&mut self, snapshot: GridSnapshot) {
        self.rows = snapshot.rows;
        self.columns = snapshot.columns;
        self.cells = vec![vec![CellValue::Empty; self.columns.len()]; self.rows.len()];
        self.reindex();

        let mut missed = 0;
        for cell in &snapshot.cells {
            match self.index.resolve(cell.entity_id, &cell.column) {
                Some((row, col)) => self.cells[row][col] = cell.value.clone(),
                None => missed += 1,
            }
        }
        if missed > 0 {
            debug!(missed, "Snapshot cells outside the rendered layout");
        }
        self.revision += 1;
    }

    /// Apply one update as its own atomic mutation.
    pub fn apply(&mut self, change: &CellChange) -> ApplyOutcome {
        let result = self.apply_batch(std::slice::from_ref(change));
        if result.applied == 1 {
            ApplyOutcome::Applied
        } else if result.unchanged == 1 {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::NotFound
        }
    }

    /// Apply every update, then bump the revision once.
    pub fn apply_batch(&mut self, changes: &[CellChange]) -> BatchApply {
        let mut result = BatchApply::default();
        for change in changes {
            match self.place(change.entity_id, &change.column, &change.value) {
                ApplyOutcome::Applied => result.applied += 1,
                ApplyOutcome::Unchanged => result.unchanged += 1,
                ApplyOutcome::NotFound => result.missed += 1,
            }
        }
        if result.applied > 0 {
            self.revision += 1;
        }
        result
    }

    /// Local edit; returns the previous value, or `None` if the cell is not
    /// rendered.
    pub fn local_edit(&mut self, key: &FieldKey, value: CellValue) -> Option<CellValue> {
        let (row, col) = self.index.resolve(key.entity_id, &key.column)?;
        let old = std::mem::replace(&mut self.cells[row][col], value);
        self.revision += 1;
        Some(old)
    }

    fn place(&mut self, entity_id: EntityId, column: &ColumnKey, value: &CellValue) -> ApplyOutcome {
        let Some((row, col)) = self.index.resolve(entity_id, column) else {
            return ApplyOutcome::NotFound;
        };
        let cell = &mut self.cells[row][col];
        if *cell == *value {
            return ApplyOutcome::Unchanged;
        }
        *cell = value.clone();
        ApplyOutcome::Applied
    }

    /// Add a row (account) or a client column. Returns `false` if it is
    /// already rendered.
    pub fn insert_entity(&mut self, entity: Entity) -> bool {
        match entity.kind {
            EntityKind::Account => {
                if self.index.row_of(entity.id).is_some() {
                    return false;
                }
                self.cells.push(vec![CellValue::Empty; self.columns.len()]);
                self.rows.push(entity);
            }
            EntityKind::Client => {
                let column = ColumnKey::Client(entity.id);
                if self.index.column_of(&column).is_some() {
                    return false;
                }
                // Client columns come before attribute columns.
                let position = self
                    .columns
                    .iter()
                    .take_while(|c| matches!(c, ColumnKey::Client(_)))
                    .count();
                self.columns.insert(position, column);
                for row in &mut self.cells {
                    row.insert(position, CellValue::Empty);
                }
            }
        }
        self.reindex();
        self.revision += 1;
        true
    }

    /// Drop a row or client column. Returns `false` if it was not rendered.
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        if let Some(row) = self.index.row_of(id) {
            self.rows.remove(row);
            self.cells.remove(row);
        } else if let Some(col) = self.index.column_of(&ColumnKey::Client(id)) {
            self.columns.remove(col);
            for row in &mut self.cells {
                row.remove(col);
            }
        } else {
            return false;
        }
        self.reindex();
        self.revision += 1;
        true
    }

    fn reindex(&mut self) {
        self.index
            .rebuild(self.rows.iter().map(|e| e.id), self.columns.iter());
    }

    pub fn value(&self, key: &FieldKey) -> Option<&CellValue> {
        let (row, col) = self.index.resolve(key.entity_id, &key.column)?;
        Some(&self.cells[row][col])
    }

    pub fn rows(&self) -> &[Entity] {
        &self.rows
    }

    pub fn columns(&self) -> &[ColumnKey] {
        &self.columns
    }

    pub fn index(&self) -> &LookupIndex {
        &self.index
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Count of cells holding a value.
    pub fn filled_cells(&self) -> usize {
        self.cells
            .iter()
            .flatten()
            .filter(|v| !v.is_empty())
            .count()
    }
}
