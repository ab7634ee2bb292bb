//! The ordered parameter collection.
use std::fmt;

use crate::types::PgValue;

/// A named parameter: the name as written in the SQL (the `@` sigil is
/// optional when adding) and its value.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    value: PgValue,
}

impl Param {
    /// The name the parameter was added under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &PgValue {
        &self.value
    }

    /// Whether `token` (a `@name` occurrence in the SQL) refers to this
    /// parameter. Substitution matching is case-insensitive.
    pub(crate) fn matches(&self, token: &str) -> bool {
        let name = self.name.strip_prefix('@').unwrap_or(&self.name);
        let token = token.strip_prefix('@').unwrap_or(token);
        name.eq_ignore_ascii_case(token)
    }
}

/// Ordered collection of named parameters.
///
/// # Example
///
/// ```
/// use pgline::Params;
///
/// let mut params = Params::new();
/// params.push("id", 7).push("name", "esther").push("note", Option::<&str>::None);
///
/// assert_eq!(params.len(), 3);
/// assert_eq!(params.get("name").unwrap().value(), &pgline::PgValue::Text("esther".into()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Params {
    items: Vec<Param>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<PgValue>) -> &mut Self {
        self.items.push(Param { name: name.into(), value: value.into() });
        self
    }

    /// Look up a parameter by the exact name it was added under.
    ///
    /// Unlike SQL substitution, this lookup is case-sensitive.
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.items.iter().find(|p| p.name == name)
    }

    /// Find the parameter a `@name` SQL token refers to,
    /// case-insensitively.
    pub(crate) fn resolve(&self, token: &str) -> Option<&Param> {
        self.items.iter().find(|p| p.matches(token))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Param> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = &'a Param;
    type IntoIter = std::slice::Iter<'a, Param>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name.strip_prefix('@').unwrap_or(&self.name))
    }
}
