//! Declared SQL column type → primitive type mapping.
//!
//! Covers the spellings found in MySQL, PostgreSQL, SQL Server and SQLite dumps.
//! Unknown types map to [`PrimitiveType::String`].

use crate::core::PrimitiveType;

/// Parsed form of a declared type such as `DECIMAL(10,2) UNSIGNED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredType {
    /// Lowercased base name (`decimal`, `character varying`, ...).
    pub base: String,
    /// Length or precision argument.
    pub length: Option<u32>,
    /// Scale argument.
    pub scale: Option<u32>,
}

impl DeclaredType {
    pub fn parse(declared: &str) -> Self {
        let lower = declared.trim().to_lowercase();
        let (base, args) = match lower.find('(') {
            Some(open) => {
                let close = lower[open..].find(')').map(|c| open + c).unwrap_or(lower.len());
                (lower[..open].trim().to_string(), &lower[open + 1..close])
            }
            None => (lower.clone(), ""),
        };
        let base = base
            .trim_end_matches(" unsigned")
            .trim_end_matches(" signed")
            .trim()
            .to_string();

        let mut nums = args.split(',').map(|a| a.trim().parse::<u32>().ok());
        let length = nums.next().flatten();
        let scale = nums.next().flatten();

        Self {
            base,
            length,
            scale,
        }
    }
}

/// Map a declared SQL type to a primitive type.
pub fn map_declared_type(declared: &str) -> PrimitiveType {
    let parsed = DeclaredType::parse(declared);

    match parsed.base.as_str() {
        // Boolean (MySQL uses TINYINT(1) for bool)
        "tinyint" if parsed.length == Some(1) => PrimitiveType::Boolean,
        "bool" | "boolean" | "bit" => PrimitiveType::Boolean,

        // Integer types
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2"
        | "int4" | "int8" | "serial" | "bigserial" | "smallserial" => PrimitiveType::Integer,

        // Decimal/numeric and floating point
        "decimal" | "numeric" | "dec" | "fixed" | "money" | "smallmoney" | "float"
        | "double" | "double precision" | "real" | "float4" | "float8" => PrimitiveType::Decimal,

        // Date/time types
        "date" | "datetime" | "datetime2" | "smalldatetime" | "timestamp" | "timestamptz"
        | "timestamp with time zone" | "timestamp without time zone" | "datetimeoffset"
        | "time" | "year" => PrimitiveType::Date,

        // GUID
        "uuid" | "uniqueidentifier" => PrimitiveType::Uuid,

        // Structured
        "json" | "jsonb" => PrimitiveType::Json,

        "inet" | "cidr" => PrimitiveType::Ip,

        // Default fallback
        _ => PrimitiveType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declared_type() {
        let t = DeclaredType::parse("DECIMAL(10, 2) UNSIGNED");
        assert_eq!(t.base, "decimal");
        assert_eq!(t.length, Some(10));
        assert_eq!(t.scale, Some(2));

        let t = DeclaredType::parse("varchar(255)");
        assert_eq!(t.base, "varchar");
        assert_eq!(t.length, Some(255));
        assert_eq!(t.scale, None);

        let t = DeclaredType::parse("text");
        assert_eq!(t.length, None);
    }

    #[test]
    fn test_map_declared_type() {
        assert_eq!(map_declared_type("INT(11)"), PrimitiveType::Integer);
        assert_eq!(map_declared_type("bigint unsigned"), PrimitiveType::Integer);
        assert_eq!(map_declared_type("tinyint(1)"), PrimitiveType::Boolean);
        assert_eq!(map_declared_type("tinyint(4)"), PrimitiveType::Integer);
        assert_eq!(map_declared_type("numeric(8,3)"), PrimitiveType::Decimal);
        assert_eq!(map_declared_type("DATETIME"), PrimitiveType::Date);
        assert_eq!(map_declared_type("uniqueidentifier"), PrimitiveType::Uuid);
        assert_eq!(map_declared_type("jsonb"), PrimitiveType::Json);
        assert_eq!(map_declared_type("varchar(64)"), PrimitiveType::String);
        assert_eq!(map_declared_type("geometry"), PrimitiveType::String);
    }
}
