use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::val::Val;

/// Which child row a selector picks once its parent group is re-expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectorKind {
    Any,
    First,
    Last,
    Nth(usize),
    Top { delimiter: String, limit: usize },
    Bottom { delimiter: String, limit: usize },
}

/// How many children a selector needs and how they must be ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorSpec {
    pub limit: usize,
    pub sort: bool,
    pub trim_top: bool,
}

impl SelectorKind {
    pub fn spec(&self) -> SelectorSpec {
        match self {
            SelectorKind::Any => SelectorSpec {
                limit: 1,
                sort: false,
                trim_top: false,
            },
            SelectorKind::First => SelectorSpec {
                limit: 1,
                sort: true,
                trim_top: false,
            },
            SelectorKind::Last => SelectorSpec {
                limit: 1,
                sort: true,
                trim_top: true,
            },
            SelectorKind::Nth(position) => SelectorSpec {
                limit: (*position).max(1),
                sort: true,
                trim_top: false,
            },
            SelectorKind::Top { limit, .. } => SelectorSpec {
                limit: (*limit).max(1),
                sort: true,
                trim_top: false,
            },
            SelectorKind::Bottom { limit, .. } => SelectorSpec {
                limit: (*limit).max(1),
                sort: true,
                trim_top: true,
            },
        }
    }
}

/// Read access to the child values a selector chooses from.
pub trait Selection {
    fn size(&self) -> usize;
    fn get(&self, position: usize) -> Val;
}

/// Mergeable per-field accumulator stored alongside each row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Generator {
    Value(Val),
    Count(u64),
    Sum(Option<f64>),
    Min(Val),
    Max(Val),
    Average { sum: f64, count: u64 },
    Selector { kind: SelectorKind, value: Val },
}

impl Generator {
    pub fn eval(&self) -> Val {
        match self {
            Generator::Value(value) => value.clone(),
            Generator::Count(count) => Val::Long(*count as i64),
            Generator::Sum(Some(sum)) => Val::Double(*sum),
            Generator::Sum(None) => Val::Null,
            Generator::Min(value) | Generator::Max(value) => value.clone(),
            Generator::Average { count: 0, .. } => Val::Null,
            Generator::Average { sum, count } => Val::Double(*sum / *count as f64),
            Generator::Selector { value, .. } => value.clone(),
        }
    }

    /// Folds `other` into `self`. Generators of different kinds never meet
    /// for the same field; if they do the existing state is kept.
    pub fn merge(&mut self, other: &Generator) {
        match (self, other) {
            (Generator::Value(current), Generator::Value(incoming)) => {
                if current.is_null() {
                    *current = incoming.clone();
                }
            }
            (Generator::Count(current), Generator::Count(incoming)) => *current += incoming,
            (Generator::Sum(current), Generator::Sum(incoming)) => {
                *current = match (*current, *incoming) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                };
            }
            (Generator::Min(current), Generator::Min(incoming)) => {
                if pick_extreme(current, incoming, Ordering::Less) {
                    *current = incoming.clone();
                }
            }
            (Generator::Max(current), Generator::Max(incoming)) => {
                if pick_extreme(current, incoming, Ordering::Greater) {
                    *current = incoming.clone();
                }
            }
            (
                Generator::Average { sum, count },
                Generator::Average {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (
                Generator::Selector { kind, value },
                Generator::Selector {
                    value: incoming, ..
                },
            ) => {
                let replace = match kind {
                    SelectorKind::Last => !incoming.is_null(),
                    _ => value.is_null(),
                };
                if replace {
                    *value = incoming.clone();
                }
            }
            _ => {}
        }
    }

    pub fn selector(&self) -> Option<SelectorSpec> {
        match self {
            Generator::Selector { kind, .. } => Some(kind.spec()),
            _ => None,
        }
    }

    /// Picks the result for a selector from its parent's ordered children.
    /// Non-selector generators ignore the selection and evaluate themselves.
    pub fn select(&self, selection: &dyn Selection) -> Val {
        let Generator::Selector { kind, .. } = self else {
            return self.eval();
        };
        let size = selection.size();
        match kind {
            SelectorKind::Any | SelectorKind::First => {
                if size == 0 {
                    Val::Null
                } else {
                    selection.get(0)
                }
            }
            SelectorKind::Last => {
                if size == 0 {
                    Val::Null
                } else {
                    selection.get(size - 1)
                }
            }
            SelectorKind::Nth(position) => {
                if *position == 0 || *position > size {
                    Val::Null
                } else {
                    selection.get(position - 1)
                }
            }
            SelectorKind::Top { delimiter, .. } | SelectorKind::Bottom { delimiter, .. } => {
                let joined = (0..size)
                    .map(|position| selection.get(position))
                    .filter(|value| !value.is_null())
                    .map(|value| value.to_string())
                    .collect::<Vec<_>>()
                    .join(delimiter);
                Val::String(joined)
            }
        }
    }
}

fn pick_extreme(current: &Val, incoming: &Val, wanted: Ordering) -> bool {
    if incoming.is_null() {
        return false;
    }
    if current.is_null() {
        return true;
    }
    incoming.compare(current) == wanted
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Val>);

    impl Selection for Fixed {
        fn size(&self) -> usize {
            self.0.len()
        }

        fn get(&self, position: usize) -> Val {
            self.0[position].clone()
        }
    }

    #[test]
    fn count_and_sum_accumulate() {
        let mut count = Generator::Count(1);
        count.merge(&Generator::Count(2));
        assert_eq!(count.eval(), Val::Long(3));

        let mut sum = Generator::Sum(None);
        sum.merge(&Generator::Sum(Some(2.5)));
        sum.merge(&Generator::Sum(Some(1.5)));
        assert_eq!(sum.eval(), Val::Double(4.0));
    }

    #[test]
    fn min_max_ignore_nulls() {
        let mut min = Generator::Min(Val::Null);
        min.merge(&Generator::Min(Val::Long(5)));
        min.merge(&Generator::Min(Val::Long(2)));
        min.merge(&Generator::Min(Val::Null));
        assert_eq!(min.eval(), Val::Long(2));

        let mut max = Generator::Max(Val::Long(5));
        max.merge(&Generator::Max(Val::Double(7.5)));
        assert_eq!(max.eval(), Val::Double(7.5));
    }

    #[test]
    fn average_merges_sum_and_count() {
        let mut avg = Generator::Average { sum: 2.0, count: 1 };
        avg.merge(&Generator::Average { sum: 4.0, count: 2 });
        assert_eq!(avg.eval(), Val::Double(2.0));
        assert_eq!(Generator::Average { sum: 0.0, count: 0 }.eval(), Val::Null);
    }

    #[test]
    fn selectors_describe_their_child_requirements() {
        let last = Generator::Selector {
            kind: SelectorKind::Last,
            value: Val::Null,
        };
        assert_eq!(
            last.selector(),
            Some(SelectorSpec {
                limit: 1,
                sort: true,
                trim_top: true
            })
        );
        assert_eq!(Generator::Count(1).selector(), None);
        assert!(!SelectorKind::Any.spec().sort);
    }

    #[test]
    fn selectors_pick_from_selection() {
        let children = Fixed(vec![Val::from("a"), Val::from("b"), Val::from("c")]);
        let pick = |kind: SelectorKind| {
            Generator::Selector {
                kind,
                value: Val::Null,
            }
            .select(&children)
        };
        assert_eq!(pick(SelectorKind::First), Val::from("a"));
        assert_eq!(pick(SelectorKind::Last), Val::from("c"));
        assert_eq!(pick(SelectorKind::Nth(2)), Val::from("b"));
        assert_eq!(pick(SelectorKind::Nth(4)), Val::Null);
        assert_eq!(
            pick(SelectorKind::Top {
                delimiter: ",".into(),
                limit: 3
            }),
            Val::from("a,b,c")
        );
    }
}
