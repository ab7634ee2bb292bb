//! Sql string operation: `@name` parameter substitution.
use std::fmt;

use itoa::Buffer;

/// A statement rewritten to positional-parameter form.
#[derive(Debug)]
pub(crate) struct PreparedSql {
    /// The SQL with every `@name` replaced by `$n`.
    pub sql: String,
    /// Referenced names in first-occurrence order, `$1` first, without
    /// the `@` sigil.
    pub names: Vec<String>,
}

/// Replace every `@name` token with `$n`, where `n` is the 1-based
/// index of the name's first occurrence. Matching is case-insensitive;
/// later occurrences of a name reuse its number. Text inside
/// single-quoted literals is left untouched.
pub(crate) fn substitute(sql: &str) -> PreparedSql {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut itoa = Buffer::new();

    // segment start of plain text pending copy
    let mut plain = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            // skip string literals, honoring the '' escape
            b'\'' => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        i += 1;
                        // escaped quote continues the literal
                        if bytes.get(i) == Some(&b'\'') {
                            i += 1;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'@' if bytes.get(i + 1).is_some_and(|b| is_ident(*b)) => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_ident(bytes[end]) {
                    end += 1;
                }
                let name = &sql[start..end];

                let n = match names.iter().position(|e| e.eq_ignore_ascii_case(name)) {
                    Some(idx) => idx + 1,
                    None => {
                        names.push(name.to_string());
                        names.len()
                    }
                };

                out.push_str(&sql[plain..i]);
                out.push('$');
                out.push_str(itoa.format(n));

                i = end;
                plain = i;
            }
            _ => i += 1,
        }
    }

    out.push_str(&sql[plain..]);
    PreparedSql { sql: out, names }
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// A statement referenced a parameter that was not supplied.
pub struct SqlError {
    name: String,
}

impl SqlError {
    pub(crate) fn missing(name: &str) -> Self {
        Self { name: name.into() }
    }

    /// The referenced parameter name, without the sigil.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::error::Error for SqlError { }

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter @{} referenced by the statement was not supplied", self.name)
    }
}

impl fmt::Debug for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
