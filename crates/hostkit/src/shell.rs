//! POSIX shell quoting helpers.

/// Quote `s` as a single POSIX shell word.
///
/// Words made only of safe characters are returned unchanged; anything else
/// is wrapped in single quotes with embedded quotes escaped as `'\''`.
pub fn quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Join words into a command line, quoting each one.
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap a script so it runs under `sh -c`, elevated with `sudo -n` unless the
/// login user is already root.
pub fn elevate(script: &str, login_user: &str) -> String {
    if login_user == "root" {
        format!("sh -c {}", quote(script))
    } else {
        format!("sudo -n sh -c {}", quote(script))
    }
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ',' | '+' | '@' | '%')
}
