//! Qualified view names: the on-wire identifier of a view within a cluster.
//!
//! The encoding is `<index>\x00<field>\x00<view>\x00` and is stable; peers
//! parse it back with [`parse_qualified_name`].

use crate::error::{IndexError, IndexResult};

const SEPARATOR: char = '\0';

pub fn format_qualified_name(index: &str, field: &str, view: &str) -> String {
    format!("{index}{SEPARATOR}{field}{SEPARATOR}{view}{SEPARATOR}")
}

pub fn parse_qualified_name(name: &str) -> IndexResult<(String, String, String)> {
    let parts: Vec<&str> = name.split(SEPARATOR).collect();
    match parts.as_slice() {
        [index, field, view, ""] => Ok((index.to_string(), field.to_string(), view.to_string())),
        _ => Err(IndexError::bad_input(format!(
            "malformed qualified view name ({} separators)",
            parts.len().saturating_sub(1)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let name = format_qualified_name("i", "f", "standard");
        assert_eq!(name, "i\0f\0standard\0");
        let (index, field, view) = parse_qualified_name(&name).unwrap();
        assert_eq!((index.as_str(), field.as_str(), view.as_str()), ("i", "f", "standard"));
    }

    #[test]
    fn test_round_trip_bsi_view() {
        let name = format_qualified_name("events", "amount", "bsig_amount");
        let parsed = parse_qualified_name(&name).unwrap();
        assert_eq!(parsed, ("events".into(), "amount".into(), "bsig_amount".into()));
    }

    #[test]
    fn test_malformed() {
        assert!(parse_qualified_name("i\0f\0").is_err());
        assert!(parse_qualified_name("i\0f\0v").is_err());
        assert!(parse_qualified_name("").is_err());
    }
}
