//! Database value parsing utilities

use rusqlite::types::Type;
use rusqlite::Error as SqlError;
use uuid::Uuid;

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s).map_err(|e| SqlError::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors_are_conversion_failures() {
        assert!(matches!(
            parse_uuid("not-a-uuid"),
            Err(SqlError::FromSqlConversionFailure(_, Type::Text, _))
        ));
        assert_eq!(
            parse_uuid("00000000-0000-0000-0000-000000000001").unwrap(),
            Uuid::from_u128(1)
        );
    }
}
