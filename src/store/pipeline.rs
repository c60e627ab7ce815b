//! Declarative read-side operations.
//!
//! Filters, projections, groupings and sorts are plain values. Backends decide how to run
//! them: the MongoDB client compiles a [`Pipeline`] to aggregation stages, the in-process
//! engine interprets the same value directly. Both must agree on the semantics documented
//! on each variant.

use crate::error::{StoreError, StoreResult};
use mongodb::bson::Bson;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Document predicate. Comparisons only match values of the same type class
/// (numbers with numbers, strings with strings), as the store does.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Bson),
    Gte(String, Bson),
    Lt(String, Bson),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, other) => other,
            (this, Filter::All) => this,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), other) => {
                left.push(other);
                Filter::And(left)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        match self {
            Filter::All => Ok(()),
            Filter::Eq(field, _) | Filter::Gte(field, _) | Filter::Lt(field, _) => {
                validate_field("filter", field)
            }
            Filter::And(parts) => parts.iter().try_for_each(Filter::validate),
        }
    }
}

/// Per-document value computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Value of a top-level field; missing fields evaluate to null.
    Field(String),
    /// `temperature` converted to Celsius: `(t - 32) * 5 / 9` when `unit == "F"`, otherwise
    /// `t` unchanged.
    CelsiusTemperature,
    /// First 13 bytes of a timestamp string (`YYYY-MM-DDTHH`), i.e. the hour bucket.
    HourOf(String),
    /// Sub-document built from named expressions, for grouping on more than one key.
    Compound(Vec<(String, Expr)>),
    Literal(Bson),
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn compound(parts: &[(&str, Expr)]) -> Self {
        Self::Compound(
            parts
                .iter()
                .map(|(name, expr)| (name.to_string(), expr.clone()))
                .collect(),
        )
    }

    fn validate(&self) -> StoreResult<()> {
        match self {
            Expr::Field(name) | Expr::HourOf(name) => validate_field("expression", name),
            Expr::Compound(parts) => {
                if parts.is_empty() {
                    return Err(StoreError::query("validate", "compound key has no parts"));
                }
                for (name, expr) in parts {
                    validate_field("compound key", name)?;
                    expr.validate()?;
                }
                Ok(())
            }
            Expr::CelsiusTemperature | Expr::Literal(_) => Ok(()),
        }
    }
}

/// Group accumulators. Non-numeric inputs are skipped by `Avg`/`Sum`; `Min`/`Max` skip
/// nulls and order numbers before strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: Expr,
    pub outputs: Vec<(String, Accumulator)>,
}

impl Group {
    pub fn by(key: Expr) -> Self {
        Self {
            key,
            outputs: Vec::new(),
        }
    }

    pub fn count(self, name: &str) -> Self {
        self.with(name, Accumulator::Count)
    }

    pub fn avg(self, name: &str, expr: Expr) -> Self {
        self.with(name, Accumulator::Avg(expr))
    }

    pub fn min(self, name: &str, expr: Expr) -> Self {
        self.with(name, Accumulator::Min(expr))
    }

    pub fn max(self, name: &str, expr: Expr) -> Self {
        self.with(name, Accumulator::Max(expr))
    }

    pub fn sum(self, name: &str, expr: Expr) -> Self {
        self.with(name, Accumulator::Sum(expr))
    }

    pub fn first(self, name: &str, expr: Expr) -> Self {
        self.with(name, Accumulator::First(expr))
    }

    pub fn with(mut self, name: &str, accumulator: Accumulator) -> Self {
        self.outputs.push((name.to_string(), accumulator));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    pub fields: Vec<(String, Expr)>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, expr: Expr) -> Self {
        self.fields.push((name.to_string(), expr));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    /// Replaces each document with `_id` plus the computed fields.
    Project(Projection),
    /// Emits one document per distinct key: `_id` = key, plus one field per accumulator.
    Group(Group),
    Sort(Vec<(String, SortOrder)>),
    Limit(i64),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "match",
            Stage::Project(_) => "project",
            Stage::Group(_) => "group",
            Stage::Sort(_) => "sort",
            Stage::Limit(_) => "limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.stages.push(Stage::Match(filter));
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.stages.push(Stage::Project(projection));
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.stages.push(Stage::Group(group));
        self
    }

    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        match self.stages.last_mut() {
            Some(Stage::Sort(keys)) => keys.push((field.to_string(), order)),
            _ => self.stages.push(Stage::Sort(vec![(field.to_string(), order)])),
        }
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.stages.push(Stage::Limit(limit));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Compact description used in logs and error context, e.g. `match>project>group>sort`.
    pub fn shape(&self) -> String {
        self.stages
            .iter()
            .map(Stage::name)
            .collect::<Vec<_>>()
            .join(">")
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.stages.is_empty() {
            return Err(StoreError::query("aggregate", "pipeline has no stages"));
        }
        for stage in &self.stages {
            match stage {
                Stage::Match(filter) => filter.validate()?,
                Stage::Project(projection) => {
                    if projection.fields.is_empty() {
                        return Err(StoreError::query("aggregate", "projection has no fields"));
                    }
                    for (name, expr) in &projection.fields {
                        validate_field("projection", name)?;
                        expr.validate()?;
                    }
                }
                Stage::Group(group) => {
                    group.key.validate()?;
                    for (name, accumulator) in &group.outputs {
                        validate_field("group output", name)?;
                        if name == "_id" {
                            return Err(StoreError::query(
                                "aggregate",
                                "group output may not be named _id",
                            ));
                        }
                        match accumulator {
                            Accumulator::Count => {}
                            Accumulator::Sum(expr)
                            | Accumulator::Avg(expr)
                            | Accumulator::Min(expr)
                            | Accumulator::Max(expr)
                            | Accumulator::First(expr) => expr.validate()?,
                        }
                    }
                }
                Stage::Sort(keys) => {
                    if keys.is_empty() {
                        return Err(StoreError::query("aggregate", "sort has no keys"));
                    }
                    for (field, _) in keys {
                        validate_field("sort", field)?;
                    }
                }
                Stage::Limit(limit) => {
                    if *limit < 1 {
                        return Err(StoreError::query(
                            "aggregate",
                            format!("limit must be >= 1, got {limit}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Plain `find`: filter, optional single-key sort, optional limit.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub filter: Filter,
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<i64>,
}

impl FindQuery {
    pub fn all() -> Self {
        Self {
            filter: Filter::All,
            sort: None,
            limit: None,
        }
    }

    pub fn matching(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::all()
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.sort = Some(("timestamp".to_string(), SortOrder::Descending));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        self.filter.validate()?;
        if let Some((field, _)) = &self.sort {
            validate_field("sort", field)?;
        }
        if let Some(limit) = self.limit {
            if limit < 1 {
                return Err(StoreError::query(
                    "find",
                    format!("limit must be >= 1, got {limit}"),
                ));
            }
        }
        Ok(())
    }
}

fn validate_field(role: &str, name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::query("validate", format!("empty {role} field name")));
    }
    if name.starts_with('$') {
        return Err(StoreError::query(
            "validate",
            format!("{role} field {name:?} may not start with '$'"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_lists_stage_names() {
        let pipeline = Pipeline::new()
            .filter(Filter::eq("type", "exterior"))
            .project(Projection::new().field("temperature_c", Expr::CelsiusTemperature))
            .group(Group::by(Expr::field("type")).count("readings"))
            .sort_by("_id", SortOrder::Ascending)
            .sort_by("readings", SortOrder::Descending)
            .limit(5);
        assert_eq!(pipeline.shape(), "match>project>group>sort>limit");
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn malformed_pipelines_are_query_errors() {
        let cases = [
            Pipeline::new(),
            Pipeline::new().limit(0),
            Pipeline::new().project(Projection::new()),
            Pipeline::new().filter(Filter::eq("$where", "x")),
            Pipeline::new().group(Group::by(Expr::field("type")).count("_id")),
            Pipeline::new().group(Group::by(Expr::Compound(Vec::new())).count("n")),
        ];
        for pipeline in cases {
            let err = pipeline.validate().unwrap_err();
            assert_eq!(err.kind(), "query", "{pipeline:?}");
        }
    }

    #[test]
    fn and_flattens_nested_filters() {
        let filter = Filter::All
            .and(Filter::gte("timestamp", "a"))
            .and(Filter::lt("timestamp", "b"))
            .and(Filter::eq("type", "interior"));
        match filter {
            Filter::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn find_rejects_zero_limit() {
        assert!(FindQuery::all().limit(0).validate().is_err());
        assert!(FindQuery::all().newest_first().limit(1).validate().is_ok());
    }
}
