mod generator;
mod parser;

use std::collections::HashMap;

pub use generator::{Generator, Selection, SelectorKind, SelectorSpec};
pub use parser::parse_expression;

use crate::val::Val;

/// Maps field names to their position in incoming value rows. Names are
/// assigned positions on first use.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    positions: HashMap<String, usize>,
    names: Vec<String>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = Self::new();
        for name in names {
            index.create(&name.into());
        }
        index
    }

    pub fn create(&mut self, name: &str) -> usize {
        if let Some(position) = self.positions.get(name) {
            return *position;
        }
        let position = self.names.len();
        self.names.push(name.to_string());
        self.positions.insert(name.to_string(), position);
        position
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Field { index: usize, name: String },
    Literal(Val),
    Count,
    Sum(Box<Expression>),
    Min(Box<Expression>),
    Max(Box<Expression>),
    Average(Box<Expression>),
    Selector {
        kind: SelectorKind,
        arg: Box<Expression>,
    },
}

impl Expression {
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Expression::Field { .. } | Expression::Literal(_))
    }

    /// Evaluates a scalar expression against one row.
    pub fn value(&self, values: &[Val]) -> Val {
        match self {
            Expression::Field { index, .. } => values.get(*index).cloned().unwrap_or_default(),
            Expression::Literal(value) => value.clone(),
            _ => Val::Null,
        }
    }

    /// Creates the accumulator for one row with that row already applied.
    pub fn create_generator(&self, values: &[Val]) -> Generator {
        match self {
            Expression::Field { .. } | Expression::Literal(_) => {
                Generator::Value(self.value(values))
            }
            Expression::Count => Generator::Count(1),
            Expression::Sum(arg) => Generator::Sum(arg.value(values).to_f64()),
            Expression::Min(arg) => Generator::Min(numeric_or_raw(arg.value(values))),
            Expression::Max(arg) => Generator::Max(numeric_or_raw(arg.value(values))),
            Expression::Average(arg) => match arg.value(values).to_f64() {
                Some(value) => Generator::Average {
                    sum: value,
                    count: 1,
                },
                None => Generator::Average { sum: 0.0, count: 0 },
            },
            Expression::Selector { kind, arg } => Generator::Selector {
                kind: kind.clone(),
                value: arg.value(values),
            },
        }
    }
}

fn numeric_or_raw(value: Val) -> Val {
    match &value {
        Val::String(_) => value.to_f64().map(Val::Double).unwrap_or(value),
        _ => value,
    }
}
