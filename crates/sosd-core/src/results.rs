//! Tabular query results as handed to clients.

use serde::{Deserialize, Serialize};

use crate::types::Guid;

/// Column names plus string-encoded rows. `None` is the NULL sentinel.
///
/// Ownership of a result set moves to the caller on retrieval; the daemon
/// keeps no copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "ResultEnvelope", try_from = "ResultEnvelope")]
pub struct ResultSet {
    pub query_guid: Guid,
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub exec_duration_ms: u64,
}

/// Wire form of a [`ResultSet`], carrying explicit counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub query_guid: Guid,
    pub column_count: usize,
    pub column_names: Vec<String>,
    pub row_count: usize,
    pub rows: Vec<Vec<Option<String>>>,
    #[serde(default)]
    pub exec_duration_ms: u64,
}

impl From<ResultSet> for ResultEnvelope {
    fn from(rs: ResultSet) -> Self {
        Self {
            query_guid: rs.query_guid,
            column_count: rs.column_names.len(),
            row_count: rs.rows.len(),
            column_names: rs.column_names,
            rows: rs.rows,
            exec_duration_ms: rs.exec_duration_ms,
        }
    }
}

impl TryFrom<ResultEnvelope> for ResultSet {
    type Error = String;

    fn try_from(env: ResultEnvelope) -> Result<Self, Self::Error> {
        if env.column_count != env.column_names.len() {
            return Err(format!(
                "column_count {} does not match {} column names",
                env.column_count,
                env.column_names.len()
            ));
        }
        if env.row_count != env.rows.len() {
            return Err(format!(
                "row_count {} does not match {} rows",
                env.row_count,
                env.rows.len()
            ));
        }
        if let Some(bad) = env.rows.iter().position(|r| r.len() != env.column_count) {
            return Err(format!(
                "row {bad} has {} cells, expected {}",
                env.rows[bad].len(),
                env.column_count
            ));
        }
        Ok(Self {
            query_guid: env.query_guid,
            column_names: env.column_names,
            rows: env.rows,
            exec_duration_ms: env.exec_duration_ms,
        })
    }
}

impl ResultSet {
    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the first column called `name`.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    /// Cell of `row` under column `name`; `None` when the column is missing
    /// or the cell is NULL.
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.column(name)?;
        self.rows.get(row)?.get(col)?.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ResultSet {
        ResultSet {
            query_guid: 9,
            column_names: vec!["comm_rank".into(), "energy".into()],
            rows: vec![
                vec![Some("0".into()), Some("2.0".into())],
                vec![Some("1".into()), None],
            ],
            exec_duration_ms: 3,
        }
    }

    #[test]
    fn test_envelope_carries_counts() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["column_count"], 2);
        assert_eq!(json["row_count"], 2);
        assert_eq!(json["rows"][1][1], serde_json::Value::Null);

        let back: ResultSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_inconsistent_envelope_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["row_count"] = serde_json::json!(5);
        assert!(serde_json::from_value::<ResultSet>(json).is_err());

        let mut json = serde_json::to_value(sample()).unwrap();
        json["rows"][0] = serde_json::json!(["only-one"]);
        assert!(serde_json::from_value::<ResultSet>(json).is_err());
    }

    #[test]
    fn test_cell_lookup() {
        let rs = sample();
        assert_eq!(rs.cell(0, "energy"), Some("2.0"));
        assert_eq!(rs.cell(1, "energy"), None);
        assert_eq!(rs.cell(0, "missing"), None);
        assert_eq!(rs.column_count(), 2);
        assert_eq!(rs.row_count(), 2);
    }
}
