//! Catalog - Schema metadata consumed by the optimizer
//!
//! Table definitions describe the columns and indexes of every table a
//! query references. The optimizer only needs the shape of the data:
//! column nullability for null-rejection analysis, index key parts for
//! lookup costing, and approximate row widths for join-buffer sizing.

/// SQL data types supported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// Boolean (true/false)
    Boolean,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    BigInt,
    /// 64-bit floating point
    Double,
    /// Variable-length string with max length
    Varchar(u32),
    /// Unlimited text
    Text,
    /// Timestamp (date and time)
    Timestamp,
}

impl DataType {
    /// Approximate in-buffer width of a value of this type, in bytes
    pub fn byte_width(&self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Int => 4,
            DataType::BigInt | DataType::Double | DataType::Timestamp => 8,
            // Variable-length values are costed at half their declared maximum
            DataType::Varchar(max) => (*max as usize / 2).max(1) + 2,
            DataType::Text => 64,
        }
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Whether NULL values are allowed
    pub nullable: bool,
}

impl ColumnDef {
    /// Create a new column definition
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// Set nullable
    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    /// Index name
    pub name: String,
    /// Key columns in key-part order
    pub columns: Vec<String>,
    /// Whether this is a unique index
    pub unique: bool,
    /// Whether this is a full-text index
    pub fulltext: bool,
}

impl IndexDef {
    /// Create a new index definition
    pub fn new<S: Into<String>>(name: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            fulltext: false,
        }
    }

    /// Set unique
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as a full-text index
    #[must_use]
    pub fn fulltext(mut self) -> Self {
        self.fulltext = true;
        self
    }
}

/// Index definition with key parts resolved to column positions
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    /// Index name
    pub name: String,
    /// Column position of every key part
    pub parts: Vec<usize>,
    /// Nullability of every key part
    pub nullable: Vec<bool>,
    pub unique: bool,
    pub fulltext: bool,
}

impl KeyInfo {
    /// Number of key parts
    pub fn key_parts(&self) -> usize {
        self.parts.len()
    }

    /// Key part number of the given column, if the column is part of the key
    pub fn part_of(&self, column: usize) -> Option<usize> {
        self.parts.iter().position(|&c| c == column)
    }

    /// A unique key with no nullable part identifies at most one row
    pub fn is_unique_not_null(&self) -> bool {
        self.unique && !self.nullable.iter().any(|n| *n)
    }
}

/// Table definition
#[derive(Debug, Clone)]
pub struct TableDef {
    /// Table name
    pub name: String,
    /// Column definitions
    pub columns: Vec<ColumnDef>,
    /// Index definitions, addressed by position
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    /// Create a new table definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column
    #[must_use]
    pub fn column(mut self, col: ColumnDef) -> Self {
        self.columns.push(col);
        self
    }

    /// Add an index
    #[must_use]
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a unique index named PRIMARY over the given columns.
    ///
    /// Primary key columns are made NOT NULL.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        for col in &mut self.columns {
            if columns.contains(&col.name.as_str()) {
                col.nullable = false;
            }
        }
        self.indexes
            .insert(0, IndexDef::new("PRIMARY", columns.iter().copied()).unique());
        self
    }

    /// Get column index by name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Get index position by name
    pub fn get_index_position(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|i| i.name == name)
    }

    /// Approximate width of one row, in bytes
    pub fn row_width(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.data_type.byte_width())
            .sum::<usize>()
            .max(1)
    }

    /// Resolve every index to column positions
    pub fn key_infos(&self) -> CatalogResult<Vec<KeyInfo>> {
        self.indexes.iter().map(|idx| self.resolve_index(idx)).collect()
    }

    fn resolve_index(&self, index: &IndexDef) -> CatalogResult<KeyInfo> {
        if index.columns.is_empty() {
            return Err(CatalogError::EmptyIndex(index.name.clone()));
        }
        let mut parts = Vec::with_capacity(index.columns.len());
        let mut nullable = Vec::with_capacity(index.columns.len());
        for name in &index.columns {
            let pos = self
                .get_column_index(name)
                .ok_or_else(|| CatalogError::ColumnNotFound(self.name.clone(), name.clone()))?;
            parts.push(pos);
            nullable.push(self.columns[pos].nullable);
        }
        Ok(KeyInfo {
            name: index.name.clone(),
            parts,
            nullable,
            unique: index.unique,
            fulltext: index.fulltext,
        })
    }
}

/// Catalog error
#[derive(Debug, Clone)]
pub enum CatalogError {
    /// Column not found
    ColumnNotFound(String, String),
    /// Index declared without key columns
    EmptyIndex(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::ColumnNotFound(table, col) => {
                write!(f, "Column '{}' not found in table '{}'", col, table)
            }
            CatalogError::EmptyIndex(name) => write!(f, "Index '{}' has no key columns", name),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new("users")
            .column(ColumnDef::new("id", DataType::Int))
            .column(ColumnDef::new("email", DataType::Varchar(64)))
            .column(ColumnDef::new("bio", DataType::Text))
            .primary_key(&["id"])
            .index(IndexDef::new("email_idx", ["email"]).unique())
            .index(IndexDef::new("bio_ft", ["bio"]).fulltext())
    }

    #[test]
    fn test_primary_key_is_first_and_not_null() {
        let table = users();
        let keys = table.key_infos().unwrap();
        assert_eq!(keys[0].name, "PRIMARY");
        assert!(keys[0].is_unique_not_null());
        assert!(!table.columns[0].nullable);
        // email is unique but nullable
        assert!(keys[1].unique);
        assert!(!keys[1].is_unique_not_null());
        assert!(keys[2].fulltext);
    }

    #[test]
    fn test_unknown_index_column() {
        let table = TableDef::new("t")
            .column(ColumnDef::new("a", DataType::Int))
            .index(IndexDef::new("bad", ["missing"]));
        let err = table.key_infos().unwrap_err();
        assert!(matches!(err, CatalogError::ColumnNotFound(_, ref c) if c == "missing"));
    }

    #[test]
    fn test_row_width() {
        let table = users();
        assert_eq!(table.row_width(), 4 + 34 + 64);
        assert_eq!(table.get_index_position("email_idx"), Some(1));
        assert_eq!(users().key_infos().unwrap()[1].part_of(1), Some(0));
    }
}
