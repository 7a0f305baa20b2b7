//! Name and path grammar checks.
//!
//! One function per grammar; all of them are total and allocation-free.
//! The rules are the protocol's: names are capped at 255 bytes, dotted
//! names need at least two elements, unique names start with `:`.

const MAX_NAME_LEN: usize = 255;

fn is_element_char(c: char, allow_digit_first: bool, first: bool) -> bool {
    match c {
        'A'..='Z' | 'a'..='z' | '_' => true,
        '0'..='9' => allow_digit_first || !first,
        _ => false,
    }
}

fn valid_dotted(name: &str, allow_hyphen: bool, digits_anywhere: bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        if element.is_empty() {
            return false;
        }
        for (i, c) in element.char_indices() {
            let ok = is_element_char(c, digits_anywhere, i == 0) || (allow_hyphen && c == '-');
            if !ok {
                return false;
            }
        }
        elements += 1;
    }
    elements >= 2
}

/// A well-known bus name (`org.example.Foo`) or a unique name (`:1.42`).
pub fn is_valid_bus_name(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix(':') {
        // Unique names allow digits in the first position of elements.
        !rest.is_empty() && name.len() <= MAX_NAME_LEN && valid_dotted_unique(rest)
    } else {
        valid_dotted(name, true, false)
    }
}

fn valid_dotted_unique(rest: &str) -> bool {
    let mut elements = 0;
    for element in rest.split('.') {
        if element.is_empty() {
            return false;
        }
        if !element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// An interface name: two or more dotted elements, no hyphens, elements
/// must not start with a digit.
pub fn is_valid_interface(name: &str) -> bool {
    valid_dotted(name, false, false)
}

/// An error name follows the interface grammar.
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface(name)
}

/// A member name: a single undotted element, not starting with a digit.
pub fn is_valid_member(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    name.char_indices()
        .all(|(i, c)| is_element_char(c, false, i == 0))
}

/// An object path: `/` or `/`-separated elements of `[A-Za-z0-9_]`.
pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    rest.split('/').all(|element| {
        !element.is_empty()
            && element
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Whether a bus name is a bus-assigned unique name rather than well-known.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}
