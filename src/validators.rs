//! Input validation for identifiers and rule fields
//!
//! Entity ids end up inside nftables chain names and table names come from
//! configuration, so both are checked before anything is staged. Port and
//! ICMP bounds arrive as signed integers from the policy store (`-1` is the
//! wildcard) and are narrowed here.

/// Maximum length of an entity id (chain names are `inst-<id>`)
pub const MAX_ENTITY_ID_LEN: usize = 64;

/// Validates an identifier that becomes part of a chain or table name.
///
/// Constraints:
/// - ASCII alphanumerics, underscores and hyphens only: nftables accepts more,
///   but these never need quoting in generated text.
/// - Rejects "." and "..".
fn validate_identifier(name: &str, max_len: usize) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if name.len() > max_len {
        return Err(format!("Name too long (max {max_len} chars)"));
    }

    if name == "." || name == ".." {
        return Err("Invalid name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -)".to_string());
    }

    Ok(())
}

/// Validates an entity id before a chain name is derived from it.
///
/// # Errors
///
/// Returns `Err` if the id is empty, longer than [`MAX_ENTITY_ID_LEN`], or
/// contains characters outside `[A-Za-z0-9_-]`.
///
/// # Examples
///
/// ```
/// use sgfw::validators::validate_entity_id;
///
/// assert!(validate_entity_id("vm-0001").is_ok());
/// assert!(validate_entity_id("vm 1").is_err());
/// ```
pub fn validate_entity_id(id: &str) -> Result<(), String> {
    validate_identifier(id, MAX_ENTITY_ID_LEN)
}

/// Validates the nftables table name from configuration.
///
/// # Errors
///
/// Returns `Err` on the same conditions as [`validate_entity_id`], with a
/// 32 character limit.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    validate_identifier(name, 32)
}

/// Validates a TCP/UDP port range from the policy store.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either bound is outside 0..=65535
/// - The start port is greater than the end port
pub fn validate_port_bounds(from: i32, to: i32) -> Result<(u16, u16), String> {
    let start = u16::try_from(from).map_err(|_| format!("from_port {from} is not a valid port"))?;
    let end = u16::try_from(to).map_err(|_| format!("to_port {to} is not a valid port"))?;

    if start > end {
        Err(format!("from_port {start} exceeds to_port {end}"))
    } else {
        Ok((start, end))
    }
}

/// Validates an ICMP type or code; `-1` is the wildcard and maps to `None`.
///
/// # Errors
///
/// Returns `Err` if the value is neither `-1` nor within 0..=255.
pub fn validate_icmp_value(value: i32, field: &str) -> Result<Option<u8>, String> {
    if value == crate::core::model::WILDCARD {
        return Ok(None);
    }
    u8::try_from(value)
        .map(Some)
        .map_err(|_| format!("icmp {field} {value} is outside 0..=255"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_entity_id_valid() {
        assert!(validate_entity_id("vm-1").is_ok());
        assert!(validate_entity_id("instance_000a").is_ok());
    }

    #[test]
    fn test_validate_entity_id_rejects_traversal_and_spaces() {
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("..").is_err());
        assert!(validate_entity_id("vm 1").is_err());
        assert!(validate_entity_id("vm;drop").is_err());
    }

    #[test]
    fn test_validate_entity_id_length_limit() {
        assert!(validate_entity_id(&"a".repeat(MAX_ENTITY_ID_LEN)).is_ok());
        assert!(validate_entity_id(&"a".repeat(MAX_ENTITY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("sgfw").is_ok());
        assert!(validate_table_name(&"t".repeat(33)).is_err());
    }

    #[test]
    fn test_validate_port_bounds() {
        assert_eq!(validate_port_bounds(80, 80), Ok((80, 80)));
        assert_eq!(validate_port_bounds(0, 65535), Ok((0, 65535)));
        assert!(validate_port_bounds(443, 80).is_err());
        assert!(validate_port_bounds(-1, 80).is_err());
        assert!(validate_port_bounds(1, 70000).is_err());
    }

    #[test]
    fn test_validate_icmp_value() {
        assert_eq!(validate_icmp_value(-1, "type"), Ok(None));
        assert_eq!(validate_icmp_value(0, "code"), Ok(Some(0)));
        assert_eq!(validate_icmp_value(255, "type"), Ok(Some(255)));
        assert!(validate_icmp_value(256, "type").is_err());
        assert!(validate_icmp_value(-2, "code").is_err());
    }
}
