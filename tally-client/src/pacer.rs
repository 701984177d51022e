//! Frame-paced application of large update lists.

use crate::grid::{BatchApply, Grid};
use std::time::Duration;
use tally_core::{BatchChunker, CellChange};

/// Applies updates one bounded chunk per frame, yielding to the runtime in
/// between so input and rendering are not starved by a large paste.
#[derive(Debug, Clone, Copy)]
pub struct FramePacer {
    chunker: BatchChunker,
    frame: Duration,
}

/// Outcome of a paced application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacedApply {
    pub result: BatchApply,
    /// Atomic grid updates performed.
    pub frames: usize,
}

impl FramePacer {
    pub fn new(chunk_size: usize, frame: Duration) -> Self {
        Self {
            chunker: BatchChunker::new(chunk_size),
            frame,
        }
    }

    pub fn chunker(&self) -> BatchChunker {
        self.chunker
    }

    /// Wait for the next frame; a zero frame only yields.
    pub async fn next_frame(&self) {
        if self.frame.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.frame).await;
        }
    }

    pub async fn apply(&self, grid: &mut Grid, changes: Vec<CellChange>) -> PacedApply {
        let mut paced = PacedApply::default();
        for (i, chunk) in self.chunker.split(changes).into_iter().enumerate() {
            if i > 0 {
                self.next_frame().await;
            }
            paced.result.merge(grid.apply_batch(&chunk));
            paced.frames += 1;
        }
        paced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{now, CellValue, ColumnKey, Entity, EntityId, EntityKind, FieldKey, GridSnapshot, TenantId};

    fn grid_50x50() -> Grid {
        Grid::from_snapshot(GridSnapshot {
            rows: (1..=50)
                .map(|id| Entity {
                    id: EntityId::new(id),
                    tenant_id: TenantId::new(1),
                    kind: EntityKind::Account,
                    name: format!("Account {}", id),
                    created_at: now(),
                })
                .collect(),
            columns: (1..=50).map(|c| ColumnKey::Client(EntityId::new(100 + c))).collect(),
            cells: Vec::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_update_applies_in_three_frames() {
        let mut grid = grid_50x50();
        let changes: Vec<CellChange> = (0..2500)
            .map(|i| {
                CellChange::new(
                    FieldKey::expense(i / 50 + 1, 100 + i % 50 + 1),
                    CellValue::Number(i as f64),
                )
            })
            .collect();
        let before = grid.revision();

        let pacer = FramePacer::new(1000, Duration::from_millis(16));
        let started = tokio::time::Instant::now();
        let paced = pacer.apply(&mut grid, changes).await;

        assert_eq!(paced.frames, 3);
        assert_eq!(paced.result.applied, 2500);
        assert_eq!(grid.revision(), before + 3);
        assert_eq!(started.elapsed(), Duration::from_millis(32));
    }

    #[tokio::test]
    async fn test_empty_update_takes_no_frames() {
        let mut grid = grid_50x50();
        let paced = FramePacer::new(1000, Duration::ZERO).apply(&mut grid, Vec::new()).await;
        assert_eq!(paced.frames, 0);
    }
}
