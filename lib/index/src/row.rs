use roaring::RoaringTreemap;

use crate::types::ColumnId;

/// Result of a row read: the set of column IDs with a bit set, across all
/// fragments the read fanned out to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: RoaringTreemap,
}

impl Row {
    pub fn new() -> Row {
        Row::default()
    }

    pub fn from_columns(columns: impl IntoIterator<Item = ColumnId>) -> Row {
        let mut row = Row::new();
        for column in columns {
            row.set(column);
        }
        row
    }

    pub fn set(&mut self, column: ColumnId) -> bool {
        self.columns.insert(column)
    }

    pub fn contains(&self, column: ColumnId) -> bool {
        self.columns.contains(column)
    }

    /// Bitwise OR of the other row into this one.
    pub fn union_with(&mut self, other: &Row) {
        self.columns |= &other.columns;
    }

    pub fn cardinality(&self) -> u64 {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> Vec<ColumnId> {
        self.columns.iter().collect()
    }
}
