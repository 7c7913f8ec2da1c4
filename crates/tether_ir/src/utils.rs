pub fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.char_indices() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Identifiers end up double-quoted inside SQL, so only plain ASCII words are accepted.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_from_entity_names() {
        assert_eq!(to_snake_case("Child"), "child");
        assert_eq!(to_snake_case("TestItemChild"), "test_item_child");
        assert_eq!(to_snake_case("parent"), "parent");
    }

    #[test]
    fn identifiers_reject_quotes_and_spaces() {
        assert!(is_valid_identifier("child_id"));
        assert!(is_valid_identifier("_meta"));
        assert!(!is_valid_identifier("1child"));
        assert!(!is_valid_identifier("child\"; DROP TABLE parent; --"));
        assert!(!is_valid_identifier("child id"));
        assert!(!is_valid_identifier(""));
    }
}
