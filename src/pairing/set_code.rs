//! Set code formatting and member-suffix handling
//!
//! Set codes are allocated from a database sequence and formatted `SP0007`;
//! members are addressed as `SP0007A` (GO) and `SP0007B` (NO-GO). Gaps in
//! the sequence from rolled-back transactions are fine, codes are
//! identifiers rather than counters.

pub const SET_CODE_PREFIX: &str = "SP";
pub const MEMBER_SUFFIXES: [char; 2] = ['A', 'B'];

/// Format a sequence value as a set code, e.g. `7 -> "SP0007"`.
pub fn format_set_code(sequence_value: i64) -> String {
    format!("{SET_CODE_PREFIX}{sequence_value:04}")
}

/// Split a set member identifier into `(set_code, suffix)`.
///
/// Returns `None` when the trailing character is not a member suffix or the
/// remaining set code would be empty; such strings are treated as serial
/// numbers by the resolver.
pub fn split_set_member(raw: &str) -> Option<(String, char)> {
    let trimmed = raw.trim();
    let last = trimmed.chars().last()?;
    let suffix = last.to_ascii_uppercase();
    if !MEMBER_SUFFIXES.contains(&suffix) {
        return None;
    }
    let code = &trimmed[..trimmed.len() - last.len_utf8()];
    if code.is_empty() {
        return None;
    }
    Some((code.to_string(), suffix))
}
