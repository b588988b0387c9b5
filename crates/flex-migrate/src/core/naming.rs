//! Identifier normalization for inferred entity and field names.
//!
//! Source headers and element names arrive in every imaginable shape
//! (`First Name`, `firstName`, `FIRST-NAME`). Everything the analyzer emits goes
//! through this module so generators receive one consistent convention:
//! snake_case fields, StudlyCase entities, plural snake_case tables.

use crate::error::{MigrateError, Result};

/// Maximum identifier length (conservative limit across database engines).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for suspicious content.
///
/// Rejects empty identifiers, identifiers containing null bytes, and identifiers
/// exceeding [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Convert an arbitrary label to snake_case.
///
/// Word boundaries are non-alphanumeric characters and lower→upper case
/// transitions (`orderId` → `order_id`, `HTTPCode` → `http_code`).
pub fn to_snake_case(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().trim_start_matches('\u{feff}').chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
                if prev.is_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_uppercase() && next_is_lower)
                {
                    out.push('_');
                }
            }
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }

    out.trim_matches('_').to_string()
}

/// Normalize a source header/element name into a field name.
pub fn normalize_field_name(raw: &str) -> String {
    let snake = to_snake_case(raw);
    if snake.is_empty() {
        return "field".to_string();
    }
    if snake.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("field_{}", snake);
    }
    snake
}

/// Convert snake_case (or any label) to StudlyCase.
pub fn to_studly_case(raw: &str) -> String {
    to_snake_case(raw)
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Naive English singularization, good enough for table names.
pub fn singularize(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.len() > 3 && lower.ends_with("ies") {
        return format!("{}y", &word[..word.len() - 3]);
    }
    if lower.ends_with("sses")
        || lower.ends_with("xes")
        || lower.ends_with("ches")
        || lower.ends_with("shes")
    {
        return word[..word.len() - 2].to_string();
    }
    if lower.ends_with('s')
        && !lower.ends_with("ss")
        && !lower.ends_with("us")
        && !lower.ends_with("is")
        && lower.len() > 1
    {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

/// Naive English pluralization, the inverse of [`singularize`].
pub fn pluralize(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.ends_with('y')
        && !matches!(
            lower.chars().rev().nth(1),
            Some('a') | Some('e') | Some('i') | Some('o') | Some('u')
        )
    {
        return format!("{}ies", &word[..word.len() - 1]);
    }
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{}es", word);
    }
    format!("{}s", word)
}

/// Suggested entity name for a source label (`customer_orders` → `CustomerOrder`).
pub fn entity_name(raw: &str) -> String {
    let snake = to_snake_case(raw);
    let mut parts: Vec<String> = snake.split('_').map(str::to_string).collect();
    if let Some(last) = parts.last_mut() {
        *last = singularize(last);
    }
    let studly = to_studly_case(&parts.join("_"));
    if studly.is_empty() {
        "Record".to_string()
    } else {
        studly
    }
}

/// Suggested table/collection name for an entity (`CustomerOrder` → `customer_orders`).
pub fn table_name(entity: &str) -> String {
    let snake = to_snake_case(entity);
    let mut parts: Vec<String> = snake.split('_').map(str::to_string).collect();
    if let Some(last) = parts.last_mut() {
        *last = pluralize(last);
    }
    parts.join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad\0name").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
        assert!(validate_identifier(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("First Name"), "first_name");
        assert_eq!(to_snake_case("orderId"), "order_id");
        assert_eq!(to_snake_case("HTTPCode"), "http_code");
        assert_eq!(to_snake_case("  e-mail  "), "e_mail");
        assert_eq!(to_snake_case("\u{feff}id"), "id");
        assert_eq!(to_snake_case("user__id"), "user_id");
    }

    #[test]
    fn test_normalize_field_name_edge_cases() {
        assert_eq!(normalize_field_name("%%"), "field");
        assert_eq!(normalize_field_name("2024 total"), "field_2024_total");
    }

    #[test]
    fn test_studly_case() {
        assert_eq!(to_studly_case("order_item"), "OrderItem");
        assert_eq!(to_studly_case("user"), "User");
    }

    #[test]
    fn test_singularize_and_pluralize() {
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("users"), "user");
        assert_eq!(singularize("status"), "status");
        assert_eq!(singularize("address"), "address");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("key"), "keys");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("user"), "users");
    }

    #[test]
    fn test_entity_and_table_names() {
        assert_eq!(entity_name("customer_orders"), "CustomerOrder");
        assert_eq!(entity_name("People-Data.csv"), "PeopleDataCsv");
        assert_eq!(entity_name("***"), "Record");
        assert_eq!(table_name("CustomerOrder"), "customer_orders");
        assert_eq!(table_name("Category"), "categories");
    }
}
