//! Syntax rules for the names carried in message headers.
//!
//! These checks are purely lexical; whether a name is actually owned is
//! the broker's business.

/// Maximum length of any name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

fn is_element_char(c: char, digits_ok: bool, dash_ok: bool) -> bool {
    c.is_ascii_alphabetic()
        || c == '_'
        || (dash_ok && c == '-')
        || (digits_ok && c.is_ascii_digit())
}

fn valid_dotted(name: &str, dash_ok: bool, leading_digits_ok: bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        let mut chars = element.chars();
        match chars.next() {
            Some(first) if is_element_char(first, leading_digits_ok, dash_ok) => {}
            _ => return false,
        }
        if !chars.all(|c| is_element_char(c, true, dash_ok)) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// A broker-assigned unique name: `:` followed by at least two dotted
/// elements, which may be purely numeric.
pub fn is_valid_unique_name(name: &str) -> bool {
    match name.strip_prefix(':') {
        Some(rest) => valid_dotted(rest, true, true),
        None => false,
    }
}

/// A well-known service name: at least two dotted elements, none
/// starting with a digit.
pub fn is_valid_well_known_name(name: &str) -> bool {
    !name.starts_with(':') && valid_dotted(name, true, false)
}

/// Either form of bus name accepted in destination and sender fields.
pub fn is_valid_bus_name(name: &str) -> bool {
    is_valid_unique_name(name) || is_valid_well_known_name(name)
}

/// An interface name: like a well-known name but without dashes.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.starts_with(':') && valid_dotted(name, false, false)
}

/// An error name follows interface-name syntax.
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

/// A member (method or signal) name: one element, no dots.
pub fn is_valid_member_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An object path: `/`, or `/`-separated nonempty alphanumeric elements.
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..].split('/').all(|element| {
        !element.is_empty()
            && element.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names() {
        assert!(is_valid_unique_name(":1.0"));
        assert!(is_valid_unique_name(":2147.314"));
        assert!(!is_valid_unique_name(":1"));
        assert!(!is_valid_unique_name("1.0"));
        assert!(!is_valid_unique_name(":1..0"));
        assert!(!is_valid_unique_name(":"));
    }

    #[test]
    fn well_known_names() {
        assert!(is_valid_well_known_name("org.freedesktop.DBus"));
        assert!(is_valid_well_known_name("com.example.backup-agent"));
        assert!(!is_valid_well_known_name("org"));
        assert!(!is_valid_well_known_name("org..example"));
        assert!(!is_valid_well_known_name("org.2example"));
        assert!(!is_valid_well_known_name(":1.0"));
    }

    #[test]
    fn members_and_interfaces() {
        assert!(is_valid_member_name("Hello"));
        assert!(is_valid_member_name("_private2"));
        assert!(!is_valid_member_name("2Fast"));
        assert!(!is_valid_member_name("dotted.name"));
        assert!(is_valid_interface_name("org.freedesktop.DBus.Local"));
        assert!(!is_valid_interface_name("com.example.with-dash"));
    }

    #[test]
    fn object_paths() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/org/freedesktop/DBus"));
        assert!(!is_valid_object_path(""));
        assert!(!is_valid_object_path("/trailing/"));
        assert!(!is_valid_object_path("//double"));
        assert!(!is_valid_object_path("relative/path"));
    }
}
