//! Upsert synthesis.
//!
//! [`synthesize`] turns an [`UpsertSpec`] into a [`Plan`]: the statements to
//! run and how their results combine. Synthesis is pure and deterministic;
//! identical inputs produce byte-identical SQL. Which shape the plan takes
//! depends on the dialect's [`NativeUpsert`]:
//!
//! - `OnConflict`: one `INSERT ... ON CONFLICT` per batch
//! - `Merge`: one `MERGE INTO ... USING (SELECT ... UNION ALL ...)` per
//!   batch, or a per-row `UPDATE` then `INSERT` when the update would assign
//!   a conflict-key column the dialect cannot touch in a MERGE
//! - `None`: per-row `UPDATE` then `INSERT` on a miss for save and replace,
//!   per-row existence probe then `INSERT` for ignore

use crate::adapter::{DialectAdapter, bare_table_name};
use crate::capabilities::NativeUpsert;
use crate::dialects::{cached_regex, rewrite_outside_literals};
use crate::record::Record;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sqlgate_core::{DialectErrorKind, Error, Result, Value};
use std::sync::OnceLock;

/// Rows written per statement when the caller does not say otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Alias of the incoming rows inside a MERGE statement.
pub const MERGE_SOURCE: &str = "source";
/// Alias of the target table inside a MERGE statement.
pub const MERGE_TARGET: &str = "target";

static EXCLUDED_PREFIX: OnceLock<Option<Regex>> = OnceLock::new();
static EXCLUDED_COLUMN: OnceLock<Option<Regex>> = OnceLock::new();

/// What to do with rows that collide with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpsertMode {
    /// Insert new rows, update colliding ones.
    Save,
    /// Insert new rows, overwrite every non-key column of colliding ones.
    Replace,
    /// Insert new rows, leave colliding ones untouched.
    Ignore,
}

impl UpsertMode {
    /// Operation name used in logs and error context.
    pub const fn operation(&self) -> &'static str {
        match self {
            UpsertMode::Save => "save",
            UpsertMode::Replace => "replace",
            UpsertMode::Ignore => "insert_ignore",
        }
    }
}

/// Right-hand side of one assignment applied to a colliding row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateValue {
    /// The incoming row's value for this column.
    Excluded(String),
    /// A bound literal.
    Value(Value),
    /// The existing value of `column` plus `delta`.
    Counter { column: String, delta: i64 },
    /// A SQL fragment emitted verbatim. `EXCLUDED.col` references the
    /// incoming row on every dialect.
    Raw(String),
}

/// Everything needed to synthesize one upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertSpec {
    pub table: String,
    pub rows: Vec<Record>,
    pub mode: UpsertMode,
    /// Columns identifying a collision. Empty means "use the primary key";
    /// the executor resolves it before synthesis.
    pub conflict_keys: Vec<String>,
    /// Assignments for colliding rows in save mode, in order. Empty means
    /// "every non-key column from the incoming row".
    pub on_duplicate: Vec<(String, UpdateValue)>,
    /// Audit columns that record creation and must survive a save.
    pub soft_created_columns: Vec<String>,
    pub batch_size: usize,
}

impl UpsertSpec {
    pub fn new(table: impl Into<String>, mode: UpsertMode, rows: Vec<Record>) -> Self {
        Self {
            table: table.into(),
            rows,
            mode,
            conflict_keys: Vec::new(),
            on_duplicate: Vec::new(),
            soft_created_columns: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn conflict_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_duplicate(mut self, column: impl Into<String>, value: UpdateValue) -> Self {
        self.on_duplicate.push((column.into(), value));
        self
    }

    pub fn soft_created_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.soft_created_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// A synthesized statement with its bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

/// One unit of execution within a [`Plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Run once; the engine's count is used as is.
    Exec(Statement),
    /// A MERGE over `rows` incoming rows. When `upsert` is set, an engine
    /// count of exactly 0 is reported as `rows`.
    Merge {
        statement: Statement,
        rows: u64,
        upsert: bool,
    },
    /// Update the matching row; insert when nothing was updated.
    UpdateOrInsert { update: Statement, insert: Statement },
    /// Insert only when the probe finds no row.
    ProbeInsert { probe: Statement, insert: Statement },
}

/// Shape of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    OnConflict,
    Merge,
    UpdateThenInsert,
    ProbeInsert,
    PlainInsert,
}

/// Statements implementing one write.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub table: String,
    pub strategy: Strategy,
    /// `None` for plain inserts.
    pub mode: Option<UpsertMode>,
    pub conflict_keys: Vec<String>,
    pub rows: usize,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Whether duplicate-key errors count as skipped rows.
    pub fn recovers_duplicates(&self) -> bool {
        self.mode == Some(UpsertMode::Ignore)
    }

    /// Every statement in execution order (probes and fallbacks included).
    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.steps.iter().flat_map(|step| match step {
            Step::Exec(s) | Step::Merge { statement: s, .. } => vec![s],
            Step::UpdateOrInsert { update, insert } => vec![update, insert],
            Step::ProbeInsert { probe, insert } => vec![probe, insert],
        })
    }
}

fn invalid(dialect: &'static str, message: impl Into<String>) -> Error {
    Error::dialect(DialectErrorKind::InvalidInput, dialect, message)
}

/// Accumulates arguments for one statement and numbers placeholders.
struct Binder<'a> {
    adapter: &'a dyn DialectAdapter,
    args: Vec<Value>,
}

impl<'a> Binder<'a> {
    fn new(adapter: &'a dyn DialectAdapter) -> Self {
        Self {
            adapter,
            args: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.args.push(value);
        self.adapter.placeholder(self.args.len())
    }

    fn finish(self, sql: String) -> Result<Statement> {
        let (sql, args) = self.adapter.filter(sql, self.args)?;
        Ok(Statement { sql, args })
    }
}

/// Rows flattened into one column order.
struct Shape {
    columns: Vec<String>,
    values: Vec<Vec<Value>>,
}

impl Shape {
    fn new(dialect: &'static str, table: &str, rows: &[Record]) -> Result<Self> {
        if table.trim().is_empty() {
            return Err(invalid(dialect, "table name is empty"));
        }
        let Some(first) = rows.first() else {
            return Err(invalid(dialect, format!("no rows to write into '{table}'")));
        };
        if first.is_empty() {
            return Err(invalid(dialect, format!("row 0 for '{table}' has no columns")));
        }
        let columns: Vec<String> = first.columns().map(str::to_string).collect();
        let mut values = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(invalid(
                    dialect,
                    format!("row {i} for '{table}' has a different column set than row 0"),
                ));
            }
            let mut tuple = Vec::with_capacity(columns.len());
            for column in &columns {
                let Some(value) = row.get(column) else {
                    return Err(invalid(
                        dialect,
                        format!("row {i} for '{table}' is missing column '{column}'"),
                    ));
                };
                tuple.push(value.clone());
            }
            values.push(tuple);
        }
        Ok(Self { columns, values })
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(column)))
    }
}

fn counter_expr(column: String, delta: i64) -> String {
    if delta < 0 {
        format!("{column} - {}", delta.unsigned_abs())
    } else {
        format!("{column} + {delta}")
    }
}

struct Synth<'a> {
    adapter: &'a dyn DialectAdapter,
    spec: &'a UpsertSpec,
    shape: Shape,
    keys: Vec<String>,
    sets: Vec<(String, UpdateValue)>,
}

impl Synth<'_> {
    fn q(&self, ident: &str) -> String {
        self.adapter.quote(ident)
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.q(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn batch_size(&self) -> usize {
        if self.adapter.supports_multi_row_values() || !matches!(self.strategy(), Strategy::OnConflict) {
            self.spec.batch_size.max(1)
        } else {
            1
        }
    }

    fn strategy(&self) -> Strategy {
        match self.adapter.capabilities().native_upsert {
            NativeUpsert::OnConflict => Strategy::OnConflict,
            NativeUpsert::Merge if self.keys.is_empty() => Strategy::PlainInsert,
            NativeUpsert::Merge if self.needs_row_fallback() => Strategy::UpdateThenInsert,
            NativeUpsert::Merge => Strategy::Merge,
            NativeUpsert::None if self.keys.is_empty() => Strategy::PlainInsert,
            NativeUpsert::None if self.sets.is_empty() => Strategy::ProbeInsert,
            NativeUpsert::None => Strategy::UpdateThenInsert,
        }
    }

    fn needs_row_fallback(&self) -> bool {
        !self.adapter.capabilities().supports_merge_updating_conflict_cols
            && self
                .sets
                .iter()
                .any(|(column, _)| self.keys.iter().any(|k| k.eq_ignore_ascii_case(column)))
    }

    fn values_tuple(&self, binder: &mut Binder<'_>, tuple: &[Value]) -> String {
        let placeholders: Vec<String> = tuple.iter().map(|v| binder.bind(v.clone())).collect();
        format!("({})", placeholders.join(", "))
    }

    fn insert_prefix(&self) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ",
            self.q(&self.spec.table),
            self.column_list(&self.shape.columns)
        )
    }

    fn on_conflict(&self, chunk: &[Vec<Value>]) -> Result<Statement> {
        let mut binder = Binder::new(self.adapter);
        let mut sql = self.insert_prefix();
        let tuples: Vec<String> = chunk
            .iter()
            .map(|tuple| self.values_tuple(&mut binder, tuple))
            .collect();
        sql.push_str(&tuples.join(", "));
        sql.push_str(" ON CONFLICT");
        if !self.keys.is_empty() {
            sql.push_str(&format!(" ({})", self.column_list(&self.keys)));
        }
        if self.sets.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            let table = self.q(bare_table_name(&self.spec.table));
            let items: Vec<String> = self
                .sets
                .iter()
                .map(|(column, value)| {
                    let rhs = match value {
                        UpdateValue::Excluded(src) => format!("EXCLUDED.{}", self.q(src)),
                        UpdateValue::Value(v) => binder.bind(v.clone()),
                        UpdateValue::Counter { column: src, delta } => {
                            counter_expr(format!("{table}.{}", self.q(src)), *delta)
                        }
                        UpdateValue::Raw(raw) => raw.clone(),
                    };
                    format!("{} = {rhs}", self.q(column))
                })
                .collect();
            sql.push_str(" DO UPDATE SET ");
            sql.push_str(&items.join(", "));
        }
        binder.finish(sql)
    }

    fn merge(&self, chunk: &[Vec<Value>]) -> Result<Statement> {
        let mut binder = Binder::new(self.adapter);
        let suffix = self.adapter.select_suffix();
        let selects: Vec<String> = chunk
            .iter()
            .enumerate()
            .map(|(i, tuple)| {
                let items: Vec<String> = tuple
                    .iter()
                    .zip(&self.shape.columns)
                    .map(|(value, column)| {
                        let p = binder.bind(value.clone());
                        if i == 0 {
                            format!("{p} AS {}", self.q(column))
                        } else {
                            p
                        }
                    })
                    .collect();
                format!("SELECT {}{suffix}", items.join(", "))
            })
            .collect();
        let on: Vec<String> = self
            .keys
            .iter()
            .map(|k| format!("{MERGE_TARGET}.{0} = {MERGE_SOURCE}.{0}", self.q(k)))
            .collect();
        let insert_values: Vec<String> = self
            .shape
            .columns
            .iter()
            .map(|c| format!("{MERGE_SOURCE}.{}", self.q(c)))
            .collect();

        let mut sql = format!(
            "MERGE INTO {} {MERGE_TARGET} USING ({}) {MERGE_SOURCE} ON ({}) \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            self.q(&self.spec.table),
            selects.join(" UNION ALL "),
            on.join(" AND "),
            self.column_list(&self.shape.columns),
            insert_values.join(", "),
        );
        if !self.sets.is_empty() {
            let mut items = Vec::with_capacity(self.sets.len());
            for (column, value) in &self.sets {
                let rhs = match value {
                    UpdateValue::Excluded(src) => format!("{MERGE_SOURCE}.{}", self.q(src)),
                    UpdateValue::Value(v) => binder.bind(v.clone()),
                    UpdateValue::Counter { column: src, delta } => {
                        counter_expr(format!("{MERGE_TARGET}.{}", self.q(src)), *delta)
                    }
                    UpdateValue::Raw(raw) => self.excluded_to_source(raw)?,
                };
                items.push(format!("{MERGE_TARGET}.{} = {rhs}", self.q(column)));
            }
            sql.push_str(" WHEN MATCHED THEN UPDATE SET ");
            sql.push_str(&items.join(", "));
        }
        sql.push_str(self.adapter.merge_terminator());
        binder.finish(sql)
    }

    /// Point `EXCLUDED.` references in a raw fragment at the MERGE source.
    fn excluded_to_source(&self, raw: &str) -> Result<String> {
        let re = cached_regex(&EXCLUDED_PREFIX, self.adapter.name(), r"(?i)\bEXCLUDED\.")?;
        let replacement = format!("{MERGE_SOURCE}.");
        Ok(rewrite_outside_literals(raw, |part| {
            re.replace_all(part, replacement.as_str()).into_owned()
        }))
    }

    /// Bind `EXCLUDED.col` references in a raw fragment to the row's values.
    fn bind_excluded(&self, binder: &mut Binder<'_>, raw: &str, tuple: &[Value]) -> Result<String> {
        let dialect = self.adapter.name();
        let re = cached_regex(
            &EXCLUDED_COLUMN,
            dialect,
            r#"(?i)\bEXCLUDED\.[\["]?(\w+)[\]"]?"#,
        )?;
        let mut missing = None;
        let sql = rewrite_outside_literals(raw, |part| {
            re.replace_all(part, |caps: &Captures<'_>| match self.shape.index_of(&caps[1]) {
                Some(idx) => binder.bind(tuple[idx].clone()),
                None => {
                    missing = Some(caps[1].to_string());
                    caps[0].to_string()
                }
            })
            .into_owned()
        });
        match missing {
            Some(column) => Err(invalid(
                dialect,
                format!("EXCLUDED.{column} does not name a written column"),
            )),
            None => Ok(sql),
        }
    }

    fn update_or_insert(&self, tuple: &[Value]) -> Result<Step> {
        let mut binder = Binder::new(self.adapter);
        let mut items = Vec::with_capacity(self.sets.len());
        for (column, value) in &self.sets {
            let rhs = match value {
                UpdateValue::Excluded(src) => {
                    let idx = self.shape.index_of(src).ok_or_else(|| {
                        invalid(self.adapter.name(), format!("unknown column '{src}'"))
                    })?;
                    binder.bind(tuple[idx].clone())
                }
                UpdateValue::Value(v) => binder.bind(v.clone()),
                UpdateValue::Counter { column: src, delta } => counter_expr(self.q(src), *delta),
                UpdateValue::Raw(raw) => self.bind_excluded(&mut binder, raw, tuple)?,
            };
            items.push(format!("{} = {rhs}", self.q(column)));
        }
        let predicate = self.key_predicate(&mut binder, tuple)?;
        let update = binder.finish(format!(
            "UPDATE {} SET {} WHERE {predicate}",
            self.q(&self.spec.table),
            items.join(", ")
        ))?;
        Ok(Step::UpdateOrInsert {
            update,
            insert: self.single_insert(tuple)?,
        })
    }

    fn key_predicate(&self, binder: &mut Binder<'_>, tuple: &[Value]) -> Result<String> {
        let mut parts = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let idx = self.shape.index_of(key).ok_or_else(|| {
                invalid(
                    self.adapter.name(),
                    format!("conflict key '{key}' is not among the written columns"),
                )
            })?;
            parts.push(format!("{} = {}", self.q(key), binder.bind(tuple[idx].clone())));
        }
        Ok(parts.join(" AND "))
    }

    fn single_insert(&self, tuple: &[Value]) -> Result<Statement> {
        let mut binder = Binder::new(self.adapter);
        let mut sql = self.insert_prefix();
        sql.push_str(&self.values_tuple(&mut binder, tuple));
        binder.finish(sql)
    }

    fn probe_insert(&self, tuple: &[Value]) -> Result<Step> {
        let mut binder = Binder::new(self.adapter);
        let predicate = self.key_predicate(&mut binder, tuple)?;
        let probe = binder.finish(format!(
            "SELECT 1 FROM {} WHERE {predicate}",
            self.q(&self.spec.table)
        ))?;
        Ok(Step::ProbeInsert {
            probe,
            insert: self.single_insert(tuple)?,
        })
    }

    fn plan(self) -> Result<Plan> {
        let strategy = self.strategy();
        let batch = self.batch_size();
        let steps = match strategy {
            Strategy::OnConflict => self
                .shape
                .values
                .chunks(batch)
                .map(|chunk| self.on_conflict(chunk).map(Step::Exec))
                .collect::<Result<Vec<_>>>()?,
            Strategy::Merge => self
                .shape
                .values
                .chunks(batch)
                .map(|chunk| {
                    Ok(Step::Merge {
                        statement: self.merge(chunk)?,
                        rows: chunk.len() as u64,
                        upsert: self.spec.mode != UpsertMode::Ignore,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Strategy::UpdateThenInsert => self
                .shape
                .values
                .iter()
                .map(|tuple| self.update_or_insert(tuple))
                .collect::<Result<Vec<_>>>()?,
            Strategy::ProbeInsert => self
                .shape
                .values
                .iter()
                .map(|tuple| self.probe_insert(tuple))
                .collect::<Result<Vec<_>>>()?,
            // Row by row, so one duplicate only skips its own row.
            Strategy::PlainInsert => self
                .shape
                .values
                .iter()
                .map(|tuple| self.single_insert(tuple).map(Step::Exec))
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Plan {
            table: self.spec.table.clone(),
            strategy,
            mode: Some(self.spec.mode),
            conflict_keys: self.keys,
            rows: self.shape.values.len(),
            steps,
        })
    }
}

/// Assignments applied to colliding rows for `spec` under `keys`.
fn update_set(spec: &UpsertSpec, columns: &[String], keys: &[String]) -> Vec<(String, UpdateValue)> {
    let is_key = |c: &str| keys.iter().any(|k| k.eq_ignore_ascii_case(c));
    match spec.mode {
        UpsertMode::Ignore => Vec::new(),
        UpsertMode::Replace => columns
            .iter()
            .filter(|c| !is_key(c))
            .map(|c| (c.clone(), UpdateValue::Excluded(c.clone())))
            .collect(),
        UpsertMode::Save if !spec.on_duplicate.is_empty() => spec.on_duplicate.clone(),
        UpsertMode::Save => columns
            .iter()
            .filter(|c| !is_key(c))
            .filter(|c| {
                !spec
                    .soft_created_columns
                    .iter()
                    .any(|soft| soft.eq_ignore_ascii_case(c))
            })
            .map(|c| (c.clone(), UpdateValue::Excluded(c.clone())))
            .collect(),
    }
}

/// Build the plan for `spec` on `adapter`.
///
/// `spec.conflict_keys` must already hold the resolved keys (explicit or
/// primary key). Save and replace fail with `MissingConflictKey` when it is
/// empty.
pub fn synthesize(adapter: &dyn DialectAdapter, spec: &UpsertSpec) -> Result<Plan> {
    let dialect = adapter.name();
    let shape = Shape::new(dialect, &spec.table, &spec.rows)?;
    if spec.mode != UpsertMode::Ignore && spec.conflict_keys.is_empty() {
        return Err(Error::dialect(
            DialectErrorKind::MissingConflictKey,
            dialect,
            format!(
                "{} on '{}' needs conflict keys or a primary key",
                spec.mode.operation(),
                spec.table
            ),
        ));
    }
    for key in &spec.conflict_keys {
        if shape.index_of(key).is_none() {
            return Err(invalid(
                dialect,
                format!("conflict key '{key}' is not among the written columns"),
            ));
        }
    }
    for (column, value) in &spec.on_duplicate {
        if let UpdateValue::Excluded(src) = value {
            if shape.index_of(src).is_none() {
                return Err(invalid(
                    dialect,
                    format!("update of '{column}' reads unknown column '{src}'"),
                ));
            }
        }
    }
    let sets = update_set(spec, &shape.columns, &spec.conflict_keys);
    let plan = Synth {
        adapter,
        spec,
        shape,
        keys: spec.conflict_keys.clone(),
        sets,
    }
    .plan()?;
    for statement in plan.statements() {
        tracing::trace!(dialect, table = %spec.table, sql = %statement.sql, "Synthesized statement");
    }
    Ok(plan)
}

/// Build a plain multi-row insert plan.
pub fn synthesize_insert(
    adapter: &dyn DialectAdapter,
    table: &str,
    rows: &[Record],
    batch_size: usize,
) -> Result<Plan> {
    let shape = Shape::new(adapter.name(), table, rows)?;
    let batch = if adapter.supports_multi_row_values() {
        batch_size.max(1)
    } else {
        1
    };
    let spec = UpsertSpec::new(table, UpsertMode::Ignore, Vec::new());
    let synth = Synth {
        adapter,
        spec: &spec,
        shape,
        keys: Vec::new(),
        sets: Vec::new(),
    };
    let mut steps = Vec::new();
    for chunk in synth.shape.values.chunks(batch) {
        let mut binder = Binder::new(adapter);
        let mut sql = synth.insert_prefix();
        let tuples: Vec<String> = chunk
            .iter()
            .map(|tuple| synth.values_tuple(&mut binder, tuple))
            .collect();
        sql.push_str(&tuples.join(", "));
        let statement = binder.finish(sql)?;
        tracing::trace!(dialect = adapter.name(), table, sql = %statement.sql, "Synthesized insert");
        steps.push(Step::Exec(statement));
    }
    Ok(Plan {
        table: table.to_string(),
        strategy: Strategy::PlainInsert,
        mode: None,
        conflict_keys: Vec::new(),
        rows: synth.shape.values.len(),
        steps,
    })
}
