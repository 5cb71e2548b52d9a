//! In-memory dataset engine.
//!
//! A dataset owns an ordered list of JSON records and executes the search
//! pipeline (filter, project, sort, aggregate, paginate) plus the in-place
//! mutations. Callers serialize access through a per-dataset lock; search
//! needs `&self`, every mutation `&mut self`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::Config;
use crate::error::EngineError;
use crate::expr::{truthy, values_equal, CompiledExpr, EvalError, EvalModel};
use crate::query::SearchQuery;

const DEFAULT_ALLOWED_OPERATIONS: &[&str] = &["update", "reload", "delete"];

pub fn validate_dataset_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidName(name.to_string()))
    }
}

/// Response envelope for a search. `time` is stamped by the HTTP facade.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub status: String,
    pub limit: Option<usize>,
    pub matches: usize,
    pub truncated: bool,
    pub exceptions: usize,
    pub last_exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub status: String,
    pub old_size: usize,
    pub new_size: usize,
    pub exceptions: usize,
    pub last_exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub status: String,
    pub matches: usize,
    pub exceptions: usize,
    pub last_exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

/// A saved query plus its memoized response. The cache lives until any
/// mutation on the dataset.
#[derive(Debug, Clone)]
pub struct NamedSearch {
    pub query: SearchQuery,
    pub cached: Option<SearchOutcome>,
}

#[derive(Debug)]
pub struct Dataset {
    name: String,
    config: Config,
    records: Vec<Value>,
    named_search: HashMap<String, NamedSearch>,
    allowed_operations: Vec<String>,
    loaded: DateTime<Utc>,
    update_ip: Option<String>,
    size: usize,
    status: String,
    local_path: Option<PathBuf>,
    secret: Option<String>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, EngineError> {
        let name = name.into();
        validate_dataset_name(&name)?;
        let mut dataset = Self {
            name,
            config,
            records: Vec::new(),
            named_search: HashMap::new(),
            allowed_operations: Vec::new(),
            loaded: Utc::now(),
            update_ip: None,
            size: 0,
            status: "OK".to_string(),
            local_path: None,
            secret: None,
        };
        dataset.configure();
        Ok(dataset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn loaded(&self) -> DateTime<Utc> {
        self.loaded
    }

    pub fn update_ip(&self) -> Option<&str> {
        self.update_ip.as_deref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn local_path(&self) -> Option<&PathBuf> {
        self.local_path.as_ref()
    }

    pub fn set_local_path(&mut self, path: Option<PathBuf>) {
        self.local_path = path;
    }

    /// File-backed datasets never expire from a sandbox.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Swaps in a new config node and rebuilds everything derived from it:
    /// named searches (definition errors land in `status`, not in the
    /// result) and the allowed-operations gate. All caches drop.
    pub fn apply_config(&mut self, config: Config) {
        self.config = config;
        self.configure();
    }

    fn configure(&mut self) {
        self.named_search.clear();
        self.status = "OK".to_string();
        if let Some(Value::Object(searches)) = self.config.get("search") {
            for (name, desc) in searches {
                match serde_json::from_value::<SearchQuery>(desc.clone()) {
                    Ok(query) => {
                        self.named_search
                            .insert(name.clone(), NamedSearch { query, cached: None });
                    }
                    Err(err) => {
                        self.status = format!("named search {name:?} error: {err}");
                    }
                }
            }
        }
        let configured = self.config.get_string_list("allowed_operations");
        self.allowed_operations = if configured.is_empty() {
            DEFAULT_ALLOWED_OPERATIONS
                .iter()
                .map(|op| op.to_string())
                .collect()
        } else {
            configured
        };
    }

    /// Full replacement. Sets `loaded` and `size`, remembers the uploader's
    /// IP and (in sandboxes) the secret, and drops all caches.
    pub fn set_records(&mut self, records: Vec<Value>, ip: Option<String>, secret: Option<String>) {
        info!(dataset = %self.name, records = records.len(), "dataset replaced");
        self.records = records;
        self.loaded = Utc::now();
        self.update_ip = ip;
        self.secret = secret;
        self.size = self.records.iter().map(deep_size).sum();
        self.drop_caches();
    }

    pub fn check_allowed(&self, op: &str) -> Result<(), EngineError> {
        if self.allowed_operations.iter().any(|allowed| allowed == op) {
            Ok(())
        } else {
            Err(EngineError::OperationNotAllowed {
                op: op.to_string(),
                dataset: self.name.clone(),
            })
        }
    }

    /// The search pipeline. `default_limit` is the `limit` resolved over the
    /// config chain; the effective cap is the smaller of it and the query's.
    pub fn search(
        &self,
        query: &SearchQuery,
        model: &EvalModel,
        default_limit: Option<usize>,
    ) -> Result<SearchOutcome, EngineError> {
        let expr_src = query.expr_with_filter()?;
        let compiled = CompiledExpr::compile(&expr_src, model)?;

        let mut matches = 0;
        let mut exceptions = 0;
        let mut last_exception = None;
        let mut working: Vec<Value> = Vec::new();

        for record in &self.records {
            match compiled.eval(record) {
                Ok(value) if truthy(&value) => {
                    matches += 1;
                    let item = match &query.fields {
                        Some(fields) => match project(record, fields) {
                            Ok(projected) => projected,
                            Err(err) => {
                                exceptions += 1;
                                last_exception = Some(err.0);
                                continue;
                            }
                        },
                        None => record.clone(),
                    };
                    working.push(item);
                }
                Ok(_) => {}
                Err(err) => {
                    exceptions += 1;
                    last_exception = Some(err.0);
                }
            }
        }

        if let Some(sort_key) = &query.sort {
            for record in &working {
                if record.get(sort_key).is_none() {
                    return Err(EngineError::bad_input(format!(
                        "sort field {sort_key:?} missing in a matching record"
                    )));
                }
            }
            // Reversed comparator, so ties keep insertion order.
            if query.reverse {
                working.sort_by(|a, b| total_order(&b[sort_key.as_str()], &a[sort_key.as_str()]));
            } else {
                working.sort_by(|a, b| total_order(&a[sort_key.as_str()], &b[sort_key.as_str()]));
            }
        }

        let limit = min_nonnull(default_limit, query.limit);

        // Aggregations run over the full post-filter list, before
        // offset/limit narrow it.
        let aggregation = match &query.aggregate {
            Some(specs) if !specs.is_empty() => Some(aggregate(specs, &working)?),
            _ => None,
        };

        let mut out: Vec<Value> = if query.offset > 0 {
            working.into_iter().skip(query.offset).collect()
        } else {
            working
        };
        let mut truncated = false;
        if let Some(cap) = limit {
            if out.len() > cap {
                out.truncate(cap);
                truncated = true;
            }
        }

        Ok(SearchOutcome {
            status: "OK".to_string(),
            limit,
            matches,
            truncated,
            exceptions,
            last_exception,
            result: if query.discard { None } else { Some(out) },
            aggregation,
            time: None,
        })
    }

    /// Retains only records the expression rejects. Any evaluation error
    /// aborts the pass with the data unchanged.
    pub fn delete(
        &mut self,
        query: &SearchQuery,
        model: &EvalModel,
    ) -> Result<DeleteOutcome, EngineError> {
        self.check_allowed("delete")?;
        let expr_src = query.expr_with_filter()?;
        let compiled = CompiledExpr::compile(&expr_src, model)?;

        let old_size = self.records.len();
        let mut exceptions = 0;
        let mut last_exception = None;
        let mut keep = Vec::with_capacity(old_size);

        for record in &self.records {
            match compiled.eval(record) {
                Ok(value) => keep.push(!truthy(&value)),
                Err(err) => {
                    exceptions += 1;
                    last_exception = Some(err.0);
                    break;
                }
            }
        }

        if exceptions == 0 {
            let mut index = 0;
            self.records.retain(|_| {
                let retained = keep[index];
                index += 1;
                retained
            });
        }
        self.drop_caches();

        Ok(DeleteOutcome {
            status: "OK".to_string(),
            old_size,
            new_size: self.records.len(),
            exceptions,
            last_exception,
            time: None,
        })
    }

    /// Applies field assignments to every record the expression matches.
    /// Accepts the `update` mapping or the legacy `update_field` +
    /// `update_data` pair; the mapping wins when both are present.
    pub fn update(
        &mut self,
        query: &SearchQuery,
        model: &EvalModel,
        ip: Option<String>,
    ) -> Result<UpdateOutcome, EngineError> {
        self.check_allowed("update")?;

        let assignments: Map<String, Value> = if let Some(map) = &query.update {
            map.clone()
        } else if let Some(field) = &query.update_field {
            let data = query
                .update_data
                .as_ref()
                .ok_or_else(|| EngineError::bad_input("need update_data"))?;
            let value: Value = serde_json::from_str(data)
                .map_err(|err| EngineError::bad_input(format!("JSON error: {err}")))?;
            let mut map = Map::new();
            map.insert(field.clone(), value);
            map
        } else {
            return Err(EngineError::bad_input("need update or update_field"));
        };

        let expr_src = query.expr_with_filter()?;
        let compiled = CompiledExpr::compile(&expr_src, model)?;

        let mut matches = 0;
        let mut exceptions = 0;
        let mut last_exception = None;

        for record in &mut self.records {
            match compiled.eval(record) {
                Ok(value) if truthy(&value) => {
                    matches += 1;
                    if let Some(object) = record.as_object_mut() {
                        for (key, value) in &assignments {
                            object.insert(key.clone(), value.clone());
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    exceptions += 1;
                    last_exception = Some(err.0);
                }
            }
        }

        self.size = self.records.iter().map(deep_size).sum();
        self.update_ip = ip;
        self.drop_caches();

        Ok(UpdateOutcome {
            status: "OK".to_string(),
            matches,
            exceptions,
            last_exception,
            time: None,
        })
    }

    /// Appends one record. Subsequent queries observe it immediately.
    pub fn insert(&mut self, record: Value) {
        self.records.push(record);
        self.drop_caches();
    }

    pub fn named_search_names(&self) -> impl Iterator<Item = &str> {
        self.named_search.keys().map(String::as_str)
    }

    /// Runs a saved query, memoizing its envelope until the next mutation.
    /// Returns `Ok(None)` when no search by that name exists.
    pub fn run_named_search(
        &mut self,
        name: &str,
        model: &EvalModel,
        default_limit: Option<usize>,
    ) -> Result<Option<SearchOutcome>, EngineError> {
        let query = match self.named_search.get(name) {
            None => return Ok(None),
            Some(entry) => {
                if let Some(cached) = &entry.cached {
                    return Ok(Some(cached.clone()));
                }
                entry.query.clone()
            }
        };
        let outcome = self.search(&query, model, default_limit)?;
        if let Some(entry) = self.named_search.get_mut(name) {
            entry.cached = Some(outcome.clone());
        }
        Ok(Some(outcome))
    }

    fn drop_caches(&mut self) {
        for entry in self.named_search.values_mut() {
            entry.cached = None;
        }
    }
}

fn project(record: &Value, fields: &[String]) -> Result<Value, EvalError> {
    let object = record
        .as_object()
        .ok_or_else(|| EvalError("record is not an object".to_string()))?;
    let mut projected = Map::new();
    for field in fields {
        let value = object
            .get(field)
            .ok_or_else(|| EvalError(format!("key {field:?} missing")))?;
        projected.insert(field.clone(), value.clone());
    }
    Ok(Value::Object(projected))
}

fn min_nonnull(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type rank first, then within each type.
/// Keeps sorting and `distinct` deterministic for heterogeneous fields.
fn total_order(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                let item = total_order(i, j);
                if item != Ordering::Equal {
                    return item;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => Ordering::Equal,
    }
}

fn aggregate(specs: &[String], working: &[Value]) -> Result<Map<String, Value>, EngineError> {
    let mut out = Map::new();
    for spec in specs {
        let (method, field) = spec.split_once(':').ok_or_else(|| {
            EngineError::bad_input(format!(
                "cannot parse aggregation statement {spec:?}, must be in form AGG:FIELD e.g. min:price"
            ))
        })?;
        if !matches!(method, "sum" | "min" | "max" | "avg" | "distinct") {
            return Err(EngineError::bad_input(format!(
                "unknown aggregation method {method:?}, must be one of sum/min/max/avg/distinct, e.g. min:price"
            )));
        }

        let value = if working.is_empty() {
            Value::Null
        } else {
            let mut values = Vec::with_capacity(working.len());
            for record in working {
                let field_value = record.get(field).ok_or_else(|| {
                    EngineError::bad_input(format!("key exception {field:?} during aggregation"))
                })?;
                values.push(field_value.clone());
            }
            match method {
                "sum" => sum_values(&values)?,
                "avg" => avg_values(&values)?,
                "min" => extreme_value(&values, Ordering::Less)?,
                "max" => extreme_value(&values, Ordering::Greater)?,
                "distinct" => distinct_values(&values),
                _ => unreachable!(),
            }
        };
        out.insert(spec.clone(), value);
    }
    Ok(out)
}

fn numeric(values: &[Value]) -> Result<Vec<f64>, EngineError> {
    values
        .iter()
        .map(|value| {
            value.as_f64().ok_or_else(|| {
                EngineError::bad_input(format!(
                    "exception during aggregation: {} is not a number",
                    crate::expr::type_name(value)
                ))
            })
        })
        .collect()
}

fn sum_values(values: &[Value]) -> Result<Value, EngineError> {
    if values.iter().all(|v| v.as_i64().is_some()) {
        let mut total: i64 = 0;
        for value in values {
            total = total
                .checked_add(value.as_i64().unwrap_or(0))
                .ok_or_else(|| {
                    EngineError::bad_input("exception during aggregation: integer overflow")
                })?;
        }
        return Ok(Value::from(total));
    }
    let total: f64 = numeric(values)?.iter().sum();
    Ok(Value::from(total))
}

fn avg_values(values: &[Value]) -> Result<Value, EngineError> {
    let numbers = numeric(values)?;
    Ok(Value::from(
        numbers.iter().sum::<f64>() / numbers.len() as f64,
    ))
}

/// `min`/`max` over all-numeric or all-string values; anything else is a
/// client error, like the original catch-all.
fn extreme_value(values: &[Value], wanted: Ordering) -> Result<Value, EngineError> {
    let all_numbers = values.iter().all(|v| v.is_number());
    let all_strings = values.iter().all(|v| v.is_string());
    if !all_numbers && !all_strings {
        return Err(EngineError::bad_input(
            "exception during aggregation: values are not comparable",
        ));
    }
    let mut best = &values[0];
    for value in &values[1..] {
        if total_order(value, best) == wanted {
            best = value;
        }
    }
    Ok(best.clone())
}

fn distinct_values(values: &[Value]) -> Value {
    let mut unique: Vec<Value> = Vec::new();
    for value in values {
        if !unique.iter().any(|seen| values_equal(seen, value)) {
            unique.push(value.clone());
        }
    }
    unique.sort_by(total_order);
    Value::Array(unique)
}

/// Rough in-memory footprint of a record tree, in bytes. Only has to be
/// stable and monotonic, not exact.
pub fn deep_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => std::mem::size_of::<String>() + s.len(),
        Value::Array(items) => {
            std::mem::size_of::<Vec<Value>>() + items.iter().map(deep_size).sum::<usize>()
        }
        Value::Object(map) => {
            32 + map
                .iter()
                .map(|(key, item)| std::mem::size_of::<String>() + key.len() + deep_size(item))
                .sum::<usize>()
        }
    }
}
