//! Input validation for names reaching the ruleset
//!
//! Centralized checks for table, chain and interface names so repository
//! operations and the CLI agree on what is well-formed before anything is
//! staged.

/// Maximum length of a table or chain name
const NAME_MAXLEN: usize = 28;

fn validate_name(name: &str, what: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{what} name cannot be empty"));
    }
    if name.len() > NAME_MAXLEN {
        return Err(format!("{what} name too long (max {NAME_MAXLEN} characters)"));
    }
    if name == "." || name == ".." {
        return Err(format!("invalid {what} name"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("{what} name contains invalid characters"));
    }
    Ok(())
}

/// Validates a table name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or contains characters
/// outside ASCII alphanumerics plus dot, dash and underscore.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    validate_name(name, "table")
}

/// Validates a chain name. Same constraints as table names.
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    validate_name(name, "chain")
}

/// Validates a network interface specification.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A single trailing `+` marks a wildcard prefix match and is allowed.
///
/// # Errors
///
/// Returns `Err` if the name violates kernel constraints.
pub fn validate_interface(spec: &str) -> Result<(), String> {
    let name = spec.strip_suffix('+').unwrap_or(spec);

    if spec.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if spec == "." || spec == ".." {
        return Err("Invalid interface name".to_string());
    }

    if name.contains('+') {
        return Err("Wildcard `+` is only valid at the end".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_table_name("filter").is_ok());
        assert!(validate_chain_name("INPUT").is_ok());
        assert!(validate_chain_name("web-servers_2").is_ok());
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(validate_table_name("").is_err());
        assert!(validate_chain_name("a".repeat(29).as_str()).is_err());
        assert!(validate_chain_name("web servers").is_err());
        assert!(validate_table_name("..").is_err());
        assert!(validate_chain_name("web;rm").is_err());
    }

    #[test]
    fn test_interface_rules() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("eth+").is_ok());
        assert!(validate_interface("veth-ab_1.2").is_ok());
        assert!(validate_interface("0123456789abcde").is_ok());
        assert!(validate_interface("0123456789abcdef").is_err());
        assert!(validate_interface("e+th").is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("eth 0").is_err());
    }
}
