use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StoreError},
    expression::{Expression, FieldIndex, Generator, parse_expression},
    val::Val,
};

/// Table definition as supplied by the query: which fields to compute, how
/// to group, sort and filter them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default)]
    pub fields: Vec<FieldSettings>,
    #[serde(default)]
    pub show_detail: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSettings {
    pub name: String,
    /// Defaults to a reference to the field of the same name.
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub group: Option<usize>,
    #[serde(default)]
    pub sort: Option<SortSettings>,
    #[serde(default)]
    pub filter: Option<FilterSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SortSettings {
    #[serde(default)]
    pub order: usize,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub includes: Option<String>,
    #[serde(default)]
    pub excludes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl CompiledFilter {
    pub fn compile(settings: &FilterSettings) -> Result<Option<Self>> {
        let include = compile_pattern(settings.includes.as_deref())?;
        let exclude = compile_pattern(settings.excludes.as_deref())?;
        if include.is_none() && exclude.is_none() {
            return Ok(None);
        }
        Ok(Some(Self { include, exclude }))
    }

    pub fn matches(&self, value: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(value) {
                return false;
            }
        }
        match &self.exclude {
            Some(exclude) => !exclude.is_match(value),
            None => true,
        }
    }
}

fn compile_pattern(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern.map(str::trim).filter(|pattern| !pattern.is_empty()) {
        Some(pattern) => Ok(Some(Regex::new(&format!("^(?:{pattern})$"))?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct CompiledField {
    pub name: String,
    pub expression: Expression,
    pub group_depth: Option<usize>,
    pub filter: Option<CompiledFilter>,
}

/// The work `add` performs at one depth of the result tree.
#[derive(Debug, Clone, Default)]
pub struct DepthPlan {
    pub grouped: bool,
    pub group_fields: Vec<usize>,
    pub value_fields: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct CompiledDepths {
    plans: Vec<DepthPlan>,
    max_group_depth: Option<usize>,
}

impl CompiledDepths {
    fn compile(fields: &[CompiledField], show_detail: bool) -> Self {
        let max_group_depth = fields.iter().filter_map(|field| field.group_depth).max();
        let levels = match max_group_depth {
            Some(depth) if show_detail => depth + 2,
            Some(depth) => depth + 1,
            // Without grouping every row is kept as an ungrouped detail row.
            None => 1,
        };

        let value_fields: Vec<usize> = (0..fields.len()).collect();
        let plans = (0..levels)
            .map(|depth| DepthPlan {
                grouped: max_group_depth.is_some_and(|max| depth <= max),
                group_fields: fields
                    .iter()
                    .enumerate()
                    .filter(|(_, field)| field.group_depth == Some(depth))
                    .map(|(position, _)| position)
                    .collect(),
                value_fields: value_fields.clone(),
            })
            .collect();

        Self {
            plans,
            max_group_depth,
        }
    }

    pub fn plans(&self) -> &[DepthPlan] {
        &self.plans
    }

    pub fn max_depth(&self) -> usize {
        self.plans.len().saturating_sub(1)
    }

    pub fn max_group_depth(&self) -> Option<usize> {
        self.max_group_depth
    }

    pub fn has_group(&self) -> bool {
        self.max_group_depth.is_some()
    }
}

/// Orders items at one depth by their evaluated sort fields.
#[derive(Debug, Clone, Default)]
pub struct CompiledSorter {
    keys: Vec<(usize, SortDirection)>,
}

impl CompiledSorter {
    pub fn new(keys: Vec<(usize, SortDirection)>) -> Self {
        Self { keys }
    }

    pub fn compare(&self, left: &[Option<Generator>], right: &[Option<Generator>]) -> Ordering {
        for (position, direction) in &self.keys {
            let lhs = eval_at(left, *position);
            let rhs = eval_at(right, *position);
            let ordering = match direction {
                SortDirection::Ascending => lhs.compare(&rhs),
                SortDirection::Descending => rhs.compare(&lhs),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn eval_at(generators: &[Option<Generator>], position: usize) -> Val {
    generators
        .get(position)
        .and_then(Option::as_ref)
        .map(Generator::eval)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct CompiledTable {
    fields: Vec<CompiledField>,
    depths: CompiledDepths,
    sorters: Vec<Option<CompiledSorter>>,
}

impl CompiledTable {
    pub fn compile(settings: &TableSettings, index: &mut FieldIndex) -> Result<Self> {
        let mut fields = Vec::with_capacity(settings.fields.len());
        for field in &settings.fields {
            if field.name.trim().is_empty() {
                return Err(StoreError::Config("table field name cannot be empty".into()));
            }
            let source = field
                .expression
                .clone()
                .unwrap_or_else(|| format!("${{{}}}", field.name));
            let expression = parse_expression(&source, index).map_err(|err| {
                StoreError::InvalidExpression(format!("field '{}': {err}", field.name))
            })?;
            let filter = match &field.filter {
                Some(filter) => CompiledFilter::compile(filter)?,
                None => None,
            };
            fields.push(CompiledField {
                name: field.name.clone(),
                expression,
                group_depth: field.group,
                filter,
            });
        }

        let mut sort_keys: Vec<(usize, usize, SortDirection)> = settings
            .fields
            .iter()
            .enumerate()
            .filter_map(|(position, field)| {
                field
                    .sort
                    .as_ref()
                    .map(|sort| (sort.order, position, sort.direction))
            })
            .collect();
        sort_keys.sort_by_key(|(order, position, _)| (*order, *position));

        let depths = CompiledDepths::compile(&fields, settings.show_detail);
        let sorter = if sort_keys.is_empty() {
            None
        } else {
            Some(CompiledSorter::new(
                sort_keys
                    .into_iter()
                    .map(|(_, position, direction)| (position, direction))
                    .collect(),
            ))
        };
        let sorters = vec![sorter; depths.plans().len()];

        Ok(Self {
            fields,
            depths,
            sorters,
        })
    }

    pub fn fields(&self) -> &[CompiledField] {
        &self.fields
    }

    pub fn depths(&self) -> &CompiledDepths {
        &self.depths
    }

    pub fn sorter(&self, depth: usize) -> Option<&CompiledSorter> {
        self.sorters.get(depth).and_then(Option::as_ref)
    }

    pub fn has_sort(&self) -> bool {
        self.sorters.iter().any(Option::is_some)
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}
