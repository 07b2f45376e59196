use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Logical column type recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Double,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn polars_dtype(self) -> DataType {
        match self {
            ColumnType::String => DataType::String,
            ColumnType::Double => DataType::Float64,
            ColumnType::Date => DataType::Date,
            // Stored as naive UTC.
            ColumnType::Timestamp => DataType::Datetime(TimeUnit::Microseconds, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
        }
    }
}

/// Schema of the materialized observation table.
pub struct RowSchema;

impl RowSchema {
    /// Catalog column list, in storage order.
    pub fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("symbol", ColumnType::String),
            ColumnDef::new("row_ts", ColumnType::Timestamp),
            ColumnDef::new("trade_date", ColumnType::Date),
            ColumnDef::new("open", ColumnType::Double),
            ColumnDef::new("high", ColumnType::Double),
            ColumnDef::new("low", ColumnType::Double),
            ColumnDef::new("close", ColumnType::Double),
            ColumnDef::new("adjusted_close", ColumnType::Double),
            ColumnDef::new("volume", ColumnType::Double),
        ]
    }

    pub fn schema() -> Schema {
        schema_for(&Self::columns())
    }

    /// Check that `df` carries every expected column with the expected type.
    pub fn validate(df: &DataFrame) -> Result<(), SchemaError> {
        let expected = Self::schema();
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Polars schema for an arbitrary catalog column list.
pub fn schema_for(columns: &[ColumnDef]) -> Schema {
    Schema::from_iter(
        columns
            .iter()
            .map(|c| Field::new(c.name.as_str().into(), c.data_type.polars_dtype())),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lists_every_row_field() {
        let schema = RowSchema::schema();
        for name in [
            "symbol",
            "row_ts",
            "trade_date",
            "open",
            "high",
            "low",
            "close",
            "adjusted_close",
            "volume",
        ] {
            assert!(schema.contains(name), "missing {name}");
        }
    }

    #[test]
    fn validate_rejects_missing_column() {
        let df = DataFrame::new(vec![Column::new("symbol".into(), vec!["AMZN"])]).unwrap();
        let err = RowSchema::validate(&df).unwrap_err();
        assert!(matches!(err, SchemaError::MissingColumn(ref c) if c == "row_ts"));
    }

    #[test]
    fn column_type_round_trips_through_json() {
        let col = ColumnDef::new("trade_date", ColumnType::Date);
        let json = serde_json::to_string(&col).unwrap();
        assert_eq!(json, r#"{"name":"trade_date","data_type":"date"}"#);
    }
}
