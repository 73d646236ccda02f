//! Subject matching.

/// Returns `true` if `subject` matches the subscription `pattern`.
///
/// `*` matches exactly one token, a trailing `>` matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut tokens = subject.split('.');
    for expected in pattern.split('.') {
        if expected == ">" {
            return tokens.next().is_some();
        }
        match tokens.next() {
            Some(token) if expected == "*" || expected == token => {}
            _ => return false,
        }
    }
    tokens.next().is_none()
}
