//! Tally Test Utilities
//!
//! Shared test infrastructure for the tally workspace:
//! - Proptest generators for grid addresses, values and edit sequences
//! - Fixtures that seed a store with a small tenant grid
//! - Assertions on `TallyError` variants

// Re-export the in-memory store so tests need a single import
pub use tally_storage::InMemoryStore;

pub use tally_core::{
    CellChange, CellValue, ColumnKey, Entity, EntityId, EntityKind, FieldKey, Origin,
    PendingChange, RetryConfig, SessionId, StorageError, SyncConfig, TallyError, TallyResult,
    TenantId, Timestamp, UserId, ValidationError, ATTRIBUTE_FIELDS,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tally types.

    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        (1i64..1_000).prop_map(TenantId::new)
    }

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        (1i64..10_000).prop_map(EntityId::new)
    }

    pub fn arb_session_id() -> impl Strategy<Value = SessionId> {
        "[a-z]{3,8}-[0-9]{1,3}".prop_map(SessionId::new)
    }

    /// Generate a Timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    /// Client column or one of the known attribute fields.
    pub fn arb_column_key() -> impl Strategy<Value = ColumnKey> {
        prop_oneof![
            arb_entity_id().prop_map(ColumnKey::Client),
            prop::sample::select(ATTRIBUTE_FIELDS).prop_map(ColumnKey::field),
        ]
    }

    pub fn arb_field_key() -> impl Strategy<Value = FieldKey> {
        (arb_entity_id(), arb_column_key()).prop_map(|(id, column)| FieldKey::new(id, column))
    }

    /// Keys drawn from a small `rows x columns` space so sequences collide.
    pub fn arb_dense_field_key(rows: i64, columns: i64) -> impl Strategy<Value = FieldKey> {
        (1..=rows, 1..=columns).prop_map(|(row, col)| FieldKey::expense(row, 1_000 + col))
    }

    /// Finite numbers only; NaN breaks value equality.
    pub fn arb_cell_value() -> impl Strategy<Value = CellValue> {
        prop_oneof![
            Just(CellValue::Empty),
            (-1_000_000.0f64..1_000_000.0).prop_map(CellValue::Number),
            "[a-zA-Z0-9 ]{0,16}".prop_map(CellValue::Text),
        ]
    }

    pub fn arb_expense_value() -> impl Strategy<Value = CellValue> {
        prop_oneof![
            Just(CellValue::Empty),
            (0.0f64..100_000.0).prop_map(|n| CellValue::Number((n * 100.0).round() / 100.0)),
        ]
    }

    pub fn arb_cell_change() -> impl Strategy<Value = CellChange> {
        (arb_field_key(), arb_cell_value()).prop_map(|(key, value)| CellChange::new(key, value))
    }

    pub fn arb_pending_change() -> impl Strategy<Value = PendingChange> {
        (arb_field_key(), arb_cell_value(), arb_cell_value())
            .prop_map(|(key, old, new)| PendingChange::new(key, old, new))
    }

    /// A sequence of edits over a small key space, in edit order.
    pub fn arb_edit_sequence(max_len: usize) -> impl Strategy<Value = Vec<(FieldKey, CellValue)>> {
        prop::collection::vec((arb_dense_field_key(4, 4), arb_expense_value()), 0..max_len)
    }

    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u32..8, 10u64..2_000, 1u64..60, 1.0f64..4.0).prop_map(
            |(max_attempts, initial_ms, max_secs, multiplier)| RetryConfig {
                max_attempts,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_secs(max_secs).max(Duration::from_millis(initial_ms)),
                backoff_multiplier: multiplier,
            },
        )
    }

    /// A SyncConfig that passes validation.
    pub fn arb_valid_sync_config() -> impl Strategy<Value = SyncConfig> {
        (
            1u64..5_000,
            1usize..5_000,
            1u64..3_600,
            1u64..600,
            0u64..86_400,
            1u64..120,
            arb_retry_config(),
        )
            .prop_map(
                |(debounce_ms, chunk_size, window, sweep, extra_retention, poll, retry)| {
                    SyncConfig {
                        debounce: Duration::from_millis(debounce_ms),
                        chunk_size,
                        structural_window: Duration::from_secs(window),
                        dedup_sweep_interval: Duration::from_secs(sweep),
                        change_retention: Duration::from_secs(window + extra_retention),
                        poll_interval: Duration::from_secs(poll),
                        retry,
                    }
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use tally_storage::GridStore;

    pub fn tenant_id_default() -> TenantId {
        TenantId::new(1)
    }

    pub fn origin(tenant_id: TenantId, session: &str) -> Origin {
        Origin::new(tenant_id, SessionId::new(session), UserId::new("ops@example.com"))
    }

    pub fn default_origin() -> Origin {
        origin(tenant_id_default(), "fixture-session")
    }

    /// Entities created by [`seed_grid`].
    #[derive(Debug, Clone)]
    pub struct SeededGrid {
        pub accounts: Vec<Entity>,
        pub clients: Vec<Entity>,
    }

    impl SeededGrid {
        /// Expense cell address of account `row` against client `col`.
        pub fn expense_key(&self, row: usize, col: usize) -> FieldKey {
            FieldKey::new(self.accounts[row].id, ColumnKey::Client(self.clients[col].id))
        }

        /// Every expense cell address, row-major.
        pub fn expense_keys(&self) -> Vec<FieldKey> {
            (0..self.accounts.len())
                .flat_map(|row| (0..self.clients.len()).map(move |col| (row, col)))
                .map(|(row, col)| self.expense_key(row, col))
                .collect()
        }
    }

    /// Create `accounts` account rows and `clients` client columns.
    pub async fn seed_grid<S: GridStore + ?Sized>(
        store: &S,
        origin: &Origin,
        accounts: usize,
        clients: usize,
    ) -> TallyResult<SeededGrid> {
        let mut grid = SeededGrid {
            accounts: Vec::with_capacity(accounts),
            clients: Vec::with_capacity(clients),
        };
        for i in 0..accounts {
            let (entity, _) = store
                .create_entity(origin, EntityKind::Account, &format!("Account {}", i + 1))
                .await?;
            grid.accounts.push(entity);
        }
        for i in 0..clients {
            let (entity, _) = store
                .create_entity(origin, EntityKind::Client, &format!("Client {}", i + 1))
                .await?;
            grid.clients.push(entity);
        }
        Ok(grid)
    }

    /// `n` numeric expense changes cycling over the seeded grid.
    pub fn expense_changes(grid: &SeededGrid, n: usize) -> Vec<CellChange> {
        let keys = grid.expense_keys();
        (0..n)
            .map(|i| CellChange::new(keys[i % keys.len()].clone(), CellValue::Number(i as f64)))
            .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on tally result variants.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TallyResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &TallyResult<T>) {
        match result {
            Err(TallyError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &TallyResult<T>) {
        match result {
            Err(TallyError::Storage(StorageError::Unavailable { .. })) => {}
            other => panic!("Expected Unavailable error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_entity_not_found<T: std::fmt::Debug>(result: &TallyResult<T>, id: EntityId) {
        match result {
            Err(TallyError::Storage(StorageError::EntityNotFound { id: got })) => {
                assert_eq!(*got, id, "Wrong id in EntityNotFound error");
            }
            other => panic!("Expected EntityNotFound for {}, got: {:?}", id, other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &TallyResult<T>) {
        match result {
            Err(TallyError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &TallyResult<T>) {
        match result {
            Err(TallyError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}
