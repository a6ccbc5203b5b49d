//! `${NAME}` placeholders in raw config text.

/// Expand `${NAME}` placeholders from the process environment.
///
/// Placeholders naming an unset variable, an empty `${}` and a trailing
/// unterminated `${` are kept literally.
pub fn expand_env(raw: &str) -> String {
    expand(raw, |name| std::env::var(name).ok())
}

fn expand(raw: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            rest = &rest[open..];
            break;
        };

        let name = &body[..close];
        match Some(name).filter(|n| !n.is_empty()).and_then(&resolve) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[open..open + close + 3]),
        }
        rest = &body[close + 1..];
    }

    out.push_str(rest);
    out
}
