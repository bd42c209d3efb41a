use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Cluster schema as reported by a node: every index with its options and
/// fields. This is the shape persisted at the root of a backup archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    #[serde(default)]
    pub options: IndexOptions,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default)]
    pub keys: bool,
    #[serde(default)]
    pub track_existence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(default)]
    pub options: FieldOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(default)]
    pub keys: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    /// Index whose translation defines this field's row IDs. Rows of the
    /// referent index may materialise only as referencing data is written,
    /// which is why translation is always dumped after shard data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_index: Option<String>,
}

impl Schema {
    /// Reduce the schema to the single named index.
    pub fn filter_index(self, name: &str) -> ClientResult<Schema> {
        let index = self
            .indexes
            .into_iter()
            .find(|index| index.name == name)
            .ok_or(ClientError::IndexNotFound)?;
        Ok(Schema {
            indexes: vec![index],
        })
    }

    /// Serialize as JSON indented with a single tab; the archive format is
    /// stable.
    pub fn write_indented<W: Write>(&self, writer: W) -> ClientResult<()> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(writer, formatter);
        self.serialize(&mut serializer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_index_schema() -> Schema {
        Schema {
            indexes: vec![
                IndexInfo {
                    name: "a".into(),
                    options: IndexOptions {
                        keys: true,
                        track_existence: true,
                    },
                    fields: vec![],
                },
                IndexInfo {
                    name: "b".into(),
                    options: IndexOptions::default(),
                    fields: vec![FieldInfo {
                        name: "parent".into(),
                        options: FieldOptions {
                            keys: true,
                            field_type: Some("set".into()),
                            foreign_index: Some("a".into()),
                        },
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_filter_index() {
        let schema = two_index_schema().filter_index("b").unwrap();
        assert_eq!(schema.indexes.len(), 1);
        assert_eq!(schema.indexes[0].name, "b");

        assert!(matches!(
            two_index_schema().filter_index("missing"),
            Err(ClientError::IndexNotFound)
        ));
    }

    #[test]
    fn test_tab_indented_round_trip() {
        let schema = two_index_schema();
        let mut buf = Vec::new();
        schema.write_indented(&mut buf).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("{\n\t\"indexes\""));

        let parsed: Schema = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, schema);
    }
}
