// Field normalization shared by both source formats
//
// Phone: every whitespace character removed, then one leading '+' stripped.
// Full name: trimmed and lower-cased. Everything else: trimmed.

/// Canonical phone used as the join and duplicate key
pub fn normalize_phone(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.strip_prefix('+') {
        Some(rest) => rest.to_string(),
        None => compact,
    }
}

/// Lower-cased full name, the name half of the natural key
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn normalize_field(raw: &str) -> String {
    raw.trim().to_string()
}

/// `(normalizedFullName, normalizedPhone)` identifying one person
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub full_name: String,
    pub phone: String,
}

impl NaturalKey {
    pub fn new(full_name: &str, phone: &str) -> Self {
        NaturalKey {
            full_name: normalize_name(full_name),
            phone: normalize_phone(phone),
        }
    }

    /// Rows without a phone never take part in duplicate accounting
    pub fn is_countable(&self) -> bool {
        !self.phone.is_empty()
    }
}
