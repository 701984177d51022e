//! Grid addressing: entities, columns, cells.
//!
//! The grid is a matrix of account rows against columns. A column is either
//! another entity (a client, for expense cells) or a named attribute field of
//! the account itself.

use crate::identity::{EntityId, TenantId, Timestamp};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attribute fields an account row exposes as editable columns.
pub const ATTRIBUTE_FIELDS: &[&str] = &["platform", "currency", "monthly_budget", "notes"];

/// Kind of grid entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Advertising account, rendered as a row.
    Account,
    /// Client, rendered as an expense column.
    Client,
}

impl EntityKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Client => "client",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "account" => Some(EntityKind::Account),
            "client" => Some(EntityKind::Client),
            _ => None,
        }
    }
}

/// An addressable grid subject owned by exactly one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub kind: EntityKind,
    pub name: String,
    pub created_at: Timestamp,
}

/// Column half of a cell address.
///
/// Serialized as a compact string (`client:42`, `field:notes`) so it can be
/// used as a JSON map key and a database column value alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnKey {
    /// Expense cell against a client entity.
    Client(EntityId),
    /// Attribute cell of the row entity.
    Field(String),
}

impl ColumnKey {
    pub fn field(name: impl Into<String>) -> Self {
        ColumnKey::Field(name.into())
    }

    /// Check the column is addressable at all (client id positive, field known).
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ColumnKey::Client(id) if id.get() <= 0 => Err(ValidationError::InvalidValue {
                field: "column".to_string(),
                reason: format!("client id must be positive, got {}", id),
            }),
            ColumnKey::Field(name) if !ATTRIBUTE_FIELDS.contains(&name.as_str()) => {
                Err(ValidationError::InvalidValue {
                    field: "column".to_string(),
                    reason: format!("unknown attribute field '{}'", name),
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKey::Client(id) => write!(f, "client:{}", id),
            ColumnKey::Field(name) => write!(f, "field:{}", name),
        }
    }
}

impl FromStr for ColumnKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidValue {
            field: "column".to_string(),
            reason: format!("'{}': {}", s, reason),
        };
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected '<kind>:<id>'"))?;
        match prefix {
            "client" => rest
                .parse::<i64>()
                .map(|id| ColumnKey::Client(EntityId::new(id)))
                .map_err(|_| invalid("client id is not an integer")),
            "field" if !rest.is_empty() => Ok(ColumnKey::Field(rest.to_string())),
            "field" => Err(invalid("empty field name")),
            _ => Err(invalid("unknown column kind")),
        }
    }
}

impl TryFrom<String> for ColumnKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnKey> for String {
    fn from(value: ColumnKey) -> Self {
        value.to_string()
    }
}

/// Address of one editable cell: row entity plus column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldKey {
    pub entity_id: EntityId,
    pub column: ColumnKey,
}

impl FieldKey {
    pub fn new(entity_id: EntityId, column: ColumnKey) -> Self {
        Self { entity_id, column }
    }

    pub fn expense(account_id: i64, client_id: i64) -> Self {
        Self::new(EntityId::new(account_id), ColumnKey::Client(EntityId::new(client_id)))
    }

    pub fn attribute(account_id: i64, field: &str) -> Self {
        Self::new(EntityId::new(account_id), ColumnKey::field(field))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.column)
    }
}

/// Value held in a cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

/// One cell value placed at an address; the unit of every push update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChange {
    pub entity_id: EntityId,
    pub column: ColumnKey,
    pub value: CellValue,
}

impl CellChange {
    pub fn new(key: FieldKey, value: CellValue) -> Self {
        Self {
            entity_id: key.entity_id,
            column: key.column,
            value,
        }
    }

    pub fn key(&self) -> FieldKey {
        FieldKey::new(self.entity_id, self.column.clone())
    }
}

/// Full grid state for one tenant, used for initial load and full refresh.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSnapshot {
    /// Account entities in render order.
    pub rows: Vec<Entity>,
    /// Client columns followed by attribute columns.
    pub columns: Vec<ColumnKey>,
    /// Every non-empty cell.
    pub cells: Vec<CellChange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_key_string_form() -> Result<(), ValidationError> {
        let client = ColumnKey::Client(EntityId::new(7));
        assert_eq!(client.to_string(), "client:7");
        assert_eq!("client:7".parse::<ColumnKey>()?, client);

        let field = ColumnKey::field("notes");
        assert_eq!(field.to_string(), "field:notes");
        assert_eq!("field:notes".parse::<ColumnKey>()?, field);
        Ok(())
    }

    #[test]
    fn test_column_key_rejects_garbage() {
        assert!("client:abc".parse::<ColumnKey>().is_err());
        assert!("field:".parse::<ColumnKey>().is_err());
        assert!("row:1".parse::<ColumnKey>().is_err());
        assert!("nocolon".parse::<ColumnKey>().is_err());
    }

    #[test]
    fn test_column_key_validate() {
        assert!(ColumnKey::Client(EntityId::new(3)).validate().is_ok());
        assert!(ColumnKey::Client(EntityId::new(0)).validate().is_err());
        assert!(ColumnKey::field("notes").validate().is_ok());
        assert!(ColumnKey::field("salary").validate().is_err());
    }

    #[test]
    fn test_cell_value_json_shapes() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&CellValue::Empty)?, "null");
        assert_eq!(serde_json::to_string(&CellValue::Number(12.5))?, "12.5");
        assert_eq!(serde_json::to_string(&CellValue::from("x"))?, "\"x\"");

        let parsed: CellValue = serde_json::from_str("null")?;
        assert_eq!(parsed, CellValue::Empty);
        let parsed: CellValue = serde_json::from_str("200")?;
        assert_eq!(parsed, CellValue::Number(200.0));
        Ok(())
    }

    #[test]
    fn test_cell_change_serializes_column_as_string() -> Result<(), serde_json::Error> {
        let change = CellChange::new(FieldKey::expense(1, 2), CellValue::Number(5.0));
        let json = serde_json::to_value(&change)?;
        assert_eq!(json["column"], "client:2");
        assert_eq!(json["entityId"], 1);
        Ok(())
    }
}
