use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of objects by their labels.
///
/// Selectors may be built from match labels/expressions or parsed from the
/// string form accepted by `kubectl -l`, e.g. `app,tier=web,env!=prod`.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty selector term")]
    EmptyTerm,

    #[error("unbalanced parentheses in selector {0:?}")]
    Unbalanced(String),

    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("invalid label value {0:?}")]
    InvalidValue(String),

    #[error("unknown set operator {0:?}")]
    UnknownOperator(String),
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    #[cfg(test)]
    fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl FromStr for Selector {
    type Err = ParseError;

    /// Parses a comma-separated list of requirements. An empty string selects
    /// everything.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut exprs = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;
        for (i, c) in s.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| ParseError::Unbalanced(s.to_string()))?;
                }
                ',' if depth == 0 => {
                    exprs.push(s[start..i].parse()?);
                    start = i + 1;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(ParseError::Unbalanced(s.to_string()));
        }
        exprs.push(s[start..].parse()?);

        Ok(Self::from_expressions(exprs))
    }
}

#[cfg(test)]
impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

#[cfg(test)]
impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

#[cfg(test)]
impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

#[cfg(test)]
impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(key: impl Into<String>, operator: Operator, values: BTreeSet<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            Operator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl FromStr for Expression {
    type Err = ParseError;

    fn from_str(term: &str) -> Result<Self, Self::Err> {
        let term = term.trim();
        if term.is_empty() {
            return Err(ParseError::EmptyTerm);
        }

        if let Some(key) = term.strip_prefix('!') {
            return Ok(Self::new(
                parse_key(key)?,
                Operator::DoesNotExist,
                BTreeSet::new(),
            ));
        }

        if let Some(open) = term.find('(') {
            let close = term
                .rfind(')')
                .filter(|close| *close == term.len() - 1)
                .ok_or_else(|| ParseError::Unbalanced(term.to_string()))?;
            let mut head = term[..open].split_whitespace();
            let key = parse_key(head.next().unwrap_or_default())?;
            let operator = match head.next() {
                Some("in") => Operator::In,
                Some("notin") => Operator::NotIn,
                Some(op) => return Err(ParseError::UnknownOperator(op.to_string())),
                None => return Err(ParseError::UnknownOperator(String::new())),
            };
            let values = term[open + 1..close]
                .split(',')
                .map(parse_value)
                .collect::<Result<_, _>>()?;
            return Ok(Self::new(key, operator, values));
        }

        for (sep, operator) in [
            ("!=", Operator::NotIn),
            ("==", Operator::In),
            ("=", Operator::In),
        ] {
            if let Some((key, value)) = term.split_once(sep) {
                let values = Some(parse_value(value)?).into_iter().collect();
                return Ok(Self::new(parse_key(key)?, operator, values));
            }
        }

        Ok(Self::new(parse_key(term)?, Operator::Exists, BTreeSet::new()))
    }
}

fn parse_key(key: &str) -> Result<String, ParseError> {
    let key = key.trim();
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if !valid {
        return Err(ParseError::InvalidKey(key.to_string()));
    }
    Ok(key.to_string())
}

fn parse_value(value: &str) -> Result<String, ParseError> {
    let value = value.trim();
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ParseError::InvalidValue(value.to_string()));
    }
    Ok(value.to_string())
}
