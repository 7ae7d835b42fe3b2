//! Small SQL text utilities shared by change handlers, the tracker and the differ.

use crate::error::Error;

/// Quote an identifier for SQLite, doubling any embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for SQLite.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Join identifiers as a quoted, comma separated list.
pub fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check that a configured table name is a plain identifier.
/// Tracking table names are interpolated into SQL, so nothing else is accepted.
pub fn validate_table_name(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "'{}' is not a valid table name: use letters, digits and underscores only",
            name
        )));
    }
    Ok(())
}

/// Normalize SQL text for checksumming.
///
/// Comments are removed and every run of whitespace outside quoted text becomes a single
/// space. Quoted literals and identifiers (`'...'`, `"..."`, `` `...` ``, `[...]`) are kept
/// byte for byte. A trailing semicolon does not change the result.
pub fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;

    let push_space = |out: &mut String, pending: &mut bool| {
        if *pending && !out.is_empty() {
            out.push(' ');
        }
        *pending = false;
    };

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                pending_space = true;
            }
            '\'' | '"' | '`' | '[' => {
                push_space(&mut out, &mut pending_space);
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                while let Some(next) = chars.next() {
                    out.push(next);
                    if next == close {
                        // doubled quote is an escaped quote, keep scanning
                        if close != ']' && chars.peek() == Some(&close) {
                            if let Some(escaped) = chars.next() {
                                out.push(escaped);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                push_space(&mut out, &mut pending_space);
                out.push(c);
            }
        }
    }

    while out.ends_with(';') || out.ends_with(' ') {
        out.pop();
    }
    out
}
