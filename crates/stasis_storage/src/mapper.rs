//! Field-name to column-name conventions.

/// Maps a record field name to the store's column name.
pub trait ColumnMapper: Send + Sync {
    /// Returns the column name for `field`.
    fn column_name(&self, field: &str) -> String;
}

/// Snake-case convention: every ASCII uppercase letter after the first
/// character is preceded by `_`, and all letters are lowercased.
///
/// `UserName` becomes `user_name`; names that are already snake case are
/// returned unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnakeMapper;

impl ColumnMapper for SnakeMapper {
    fn column_name(&self, field: &str) -> String {
        let mut out = String::with_capacity(field.len() + 4);
        for (i, c) in field.chars().enumerate() {
            if c.is_ascii_uppercase() {
                if i > 0 {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// Identity convention: column names equal field names.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameMapper;

impl ColumnMapper for SameMapper {
    fn column_name(&self, field: &str) -> String {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_mapper_splits_camel_case() {
        assert_eq!(SnakeMapper.column_name("UserName"), "user_name");
        assert_eq!(SnakeMapper.column_name("authId"), "auth_id");
    }

    #[test]
    fn snake_mapper_keeps_snake_case() {
        assert_eq!(SnakeMapper.column_name("created_at"), "created_at");
        assert_eq!(SnakeMapper.column_name("id"), "id");
    }

    #[test]
    fn snake_mapper_splits_every_capital() {
        assert_eq!(SnakeMapper.column_name("ID"), "i_d");
    }

    #[test]
    fn same_mapper_is_identity() {
        assert_eq!(SameMapper.column_name("UserName"), "UserName");
    }
}
