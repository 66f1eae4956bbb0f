//! gridtool: a pipeline-style CSV data processor with non-standard syntax.
//!
//! The DSL exists to force real learning: its command names and word
//! operators deliberately diverge from SQL, and its error prose degrades on
//! demand (`cryptic`, `semi_helpful`, `mixed`) so the memory subsystem has
//! something to earn. Commands read from a single input string, one per
//! line; `SHOW` prints CSV to the output buffer.
//!
//! Commands: `LOAD KEEP TOSS TALLY RANK PICK DERIVE MERGE SHOW`.
//! Operators: `eq neq gt lt gte lte` (words, never symbols).
//! Aggregates: `sum count avg min max` (lowercase only).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use cortex_harness::domain::{
    DomainAdapter, DomainWorkspace, ErrorStyle, StandardAliases, ToolResult,
};
use cortex_harness::error::Result;
use cortex_harness::provider::ToolSpec;
use cortex_memory::DomainDoc;

use crate::sqlite::docs_from_root;

const RUN_GRIDTOOL_TOOL_NAME: &str = "run_gridtool";

static GRIDTOOL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b(LOAD|KEEP|TOSS|TALLY|RANK|PICK|DERIVE|MERGE|SHOW|eq|neq|gt|lt|gte|lte|sum|count|avg|min|max|asc|desc)\b",
    )
    .unwrap()
});

/// SQL habits mapped to their gridtool spelling, used for suggestions.
const SQL_MISTAKES: &[(&str, &str)] = &[
    ("SELECT", "PICK"),
    ("ORDER", "RANK"),
    ("SORT", "RANK"),
    ("GROUP", "TALLY"),
    ("OUTPUT", "SHOW"),
    ("PRINT", "SHOW"),
    ("FILTER", "KEEP"),
    ("WHERE", "KEEP"),
    ("JOIN", "MERGE"),
    ("DROP", "TOSS"),
    ("EXCLUDE", "TOSS"),
    ("COMPUTE", "DERIVE"),
    ("CALCULATE", "DERIVE"),
    ("IMPORT", "LOAD"),
    ("READ", "LOAD"),
    ("OPEN", "LOAD"),
];

const VALID_OPS: [&str; 6] = ["eq", "neq", "gt", "lt", "gte", "lte"];
const SYMBOL_OPS: [&str; 8] = ["=", "!=", ">", "<", ">=", "<=", "==", "<>"];
const AGG_FUNCS: [&str; 5] = ["sum", "count", "avg", "min", "max"];
const COMMANDS: [&str; 9] = [
    "LOAD", "KEEP", "TOSS", "TALLY", "RANK", "PICK", "DERIVE", "MERGE", "SHOW",
];

/// Cryptic-mode overrides: strip every helpful hint.
static CRYPTIC_OVERRIDES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let table: Vec<(&str, &str)> = vec![
        (r"TALLY syntax:.*", "TALLY: syntax error."),
        (r"TALLY: unexpected text.*", "TALLY: syntax error."),
        (r"RANK direction must be.*", "RANK: invalid direction."),
        (r"RANK syntax:.*", "RANK: syntax error."),
        (r"KEEP syntax:.*", "KEEP: syntax error."),
        (r"KEEP requires word operator.*", "KEEP: invalid operator."),
        (r"KEEP unknown operator.*", "KEEP: invalid operator."),
        (r"TOSS syntax:.*", "TOSS: syntax error."),
        (r"TOSS requires word operator.*", "TOSS: invalid operator."),
        (r"TOSS unknown operator.*", "TOSS: invalid operator."),
        (r"DERIVE syntax:.*", "DERIVE: syntax error."),
        (r"MERGE syntax:.*", "MERGE: syntax error."),
        (r"Unknown function '(\w+)'.*", "Unknown function '$1'."),
        (r"Column '(\w+)' not found\..*", "Column '$1' not found."),
        (r"Unknown command '(\w+)'\..*", "Unknown command '$1'."),
        (r"LOAD path must be quoted\..*", "LOAD: invalid argument."),
        (r"MERGE path must be quoted\..*", "MERGE: invalid argument."),
        (r"SHOW takes an optional.*", "SHOW: invalid argument."),
        (r"File not found:.*", "File not found."),
    ];
    table
        .into_iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
        .collect()
});

/// Semi-helpful overrides: nudge toward the fix without full syntax.
static SEMI_HELPFUL_OVERRIDES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let table: Vec<(&str, &str)> = vec![
        (r"TALLY syntax:.*", "TALLY: expected arrow operator '->' after group column."),
        (r"TALLY: unexpected text.*", "TALLY: separate multiple aggregations with commas."),
        (r"RANK direction must be.*", "RANK: direction must be a word - 'asc' or 'desc'."),
        (r"RANK syntax:.*", "RANK: requires a column name and direction."),
        (r"KEEP syntax:.*", "KEEP: requires column, operator, and value."),
        (r"KEEP requires word operator.*", "KEEP: operators must be words (like 'eq'), not symbols."),
        (r"KEEP unknown operator.*", "KEEP: unknown operator. Use word-based comparison operators."),
        (r"TOSS syntax:.*", "TOSS: requires column, operator, and value."),
        (r"TOSS requires word operator.*", "TOSS: operators must be words (like 'eq'), not symbols."),
        (r"TOSS unknown operator.*", "TOSS: unknown operator. Use word-based comparison operators."),
        (r"DERIVE syntax:.*", "DERIVE: expected 'new_col = expression' format."),
        (r"MERGE syntax:.*", "MERGE: requires a quoted path and ON keyword."),
        (r"MERGE path must be quoted\..*", "MERGE: file path must be in double quotes."),
        (r"LOAD path must be quoted\..*", "LOAD: file path must be in double quotes."),
        (
            r"Unknown function '(\w+)'.*",
            "Unknown function '$1'. Functions are case-sensitive - use lowercase.",
        ),
        (r"Column '(\w+)' not found\..*", "Column '$1' not found in current data."),
        (
            r"Unknown command '(\w+)'\..*",
            "Unknown command '$1'. This is not SQL - gridtool has its own command names.",
        ),
        (r"SHOW takes an optional.*", "SHOW: optional argument must be a number (row limit)."),
        (r#"File not found: "([^"]+)" \(resolved.*"#, "File not found: \"$1\"."),
    ];
    table
        .into_iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
        .collect()
});

/// One parse/execution failure with its line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridError {
    pub lineno: usize,
    pub message: String,
}

impl GridError {
    fn new(lineno: usize, message: impl Into<String>) -> Self {
        GridError {
            lineno,
            message: message.into(),
        }
    }

    /// Render with the error style applied to the message body.
    #[must_use]
    pub fn render(&self, style: ErrorStyle) -> String {
        let message = apply_error_style(&self.message, style);
        format!("ERROR at line {}: {message}", self.lineno)
    }
}

fn rewrite_with(table: &[(Regex, &'static str)], message: &str) -> Option<String> {
    for (pattern, replacement) in table {
        if pattern.is_match(message) {
            return Some(pattern.replace(message, *replacement).into_owned());
        }
    }
    None
}

/// Rewrite an error message for the given style. `Mixed` is resolved per
/// command before this point; it falls back to cryptic here.
#[must_use]
pub fn apply_error_style(message: &str, style: ErrorStyle) -> String {
    match style {
        ErrorStyle::Helpful => message.to_string(),
        ErrorStyle::Cryptic | ErrorStyle::Mixed => rewrite_with(&CRYPTIC_OVERRIDES, message)
            .unwrap_or_else(|| message.to_string()),
        ErrorStyle::SemiHelpful => rewrite_with(&SEMI_HELPFUL_OVERRIDES, message)
            .unwrap_or_else(|| message.to_string()),
    }
}

/// Deterministic per-command style for `Mixed` mode: alternating commands
/// get cryptic vs semi-helpful prose.
#[must_use]
pub fn mixed_style_for(command: &str) -> ErrorStyle {
    const CRYPTIC_COMMANDS: [&str; 5] = ["KEEP", "RANK", "DERIVE", "TOSS", "SHOW"];
    if CRYPTIC_COMMANDS.contains(&command) {
        ErrorStyle::Cryptic
    } else {
        ErrorStyle::SemiHelpful
    }
}

/// Ordered columnar frame flowing through the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Frame {
    fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn to_csv(&self, limit: Option<usize>) -> String {
        let mut out = String::new();
        out.push_str(&self.columns.join(","));
        out.push('\n');
        let rows = match limit {
            Some(limit) => &self.rows[..self.rows.len().min(limit)],
            None => &self.rows,
        };
        for row in rows {
            let encoded: Vec<String> = row
                .iter()
                .map(|cell| {
                    if cell.contains(',') || cell.contains('"') {
                        format!("\"{}\"", cell.replace('"', "\"\""))
                    } else {
                        cell.clone()
                    }
                })
                .collect();
            out.push_str(&encoded.join(","));
            out.push('\n');
        }
        out
    }
}

fn try_float(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

/// Format a numeric result the way the tool has always printed them: whole
/// numbers carry a trailing `.0`.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

fn compare(left: &str, op: &str, right: &str) -> bool {
    let ordering = match (try_float(left), try_float(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(left.cmp(right)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        "eq" => ordering == std::cmp::Ordering::Equal,
        "neq" => ordering != std::cmp::Ordering::Equal,
        "gt" => ordering == std::cmp::Ordering::Greater,
        "lt" => ordering == std::cmp::Ordering::Less,
        "gte" => ordering != std::cmp::Ordering::Less,
        "lte" => ordering != std::cmp::Ordering::Greater,
        _ => false,
    }
}

fn parse_quoted(text: &str) -> Option<(String, String)> {
    let text = text.trim_start();
    let rest = text.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((rest[..end].to_string(), rest[end + 1..].trim().to_string()))
}

fn available_columns_text(frame: &Frame) -> String {
    if frame.columns.is_empty() {
        "(no data loaded)".to_string()
    } else {
        frame.columns.join(", ")
    }
}

fn check_column(frame: &Frame, column: &str, lineno: usize) -> std::result::Result<usize, GridError> {
    frame.column_index(column).ok_or_else(|| {
        GridError::new(
            lineno,
            format!(
                "Column '{column}' not found. Available: {}",
                available_columns_text(frame)
            ),
        )
    })
}

fn read_csv_file(workdir: &Path, name: &str, lineno: usize) -> std::result::Result<Frame, GridError> {
    let filepath = workdir.join(name);
    if !filepath.is_file() {
        return Err(GridError::new(
            lineno,
            format!(
                "File not found: \"{name}\" (resolved to {})",
                filepath.display()
            ),
        ));
    }
    let content = std::fs::read_to_string(&filepath).map_err(|error| {
        GridError::new(lineno, format!("Failed reading \"{name}\": {error}"))
    })?;
    let mut lines = content.lines().filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Ok(Frame::default());
    };
    let columns: Vec<String> = split_csv(header);
    let rows: Vec<Vec<String>> = lines
        .map(|line| {
            let mut row = split_csv(line);
            row.resize(columns.len(), String::new());
            row
        })
        .collect();
    Ok(Frame { columns, rows })
}

fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

fn require_data(frame: &Frame, command: &str, lineno: usize) -> std::result::Result<(), GridError> {
    if frame.columns.is_empty() || frame.is_empty() {
        return Err(GridError::new(lineno, format!("{command} requires data. Use LOAD first.")));
    }
    Ok(())
}

fn tokenize_filter(args: &str) -> Vec<String> {
    static QUOTED_FILTER: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#"^(\S+)\s+(\S+)\s+"([^"]*)""#).unwrap()
    });
    let args = args.trim();
    if let Some(capture) = QUOTED_FILTER.captures(args) {
        return vec![capture[1].to_string(), capture[2].to_string(), capture[3].to_string()];
    }
    let mut iter = args.split_whitespace();
    let mut parts: Vec<String> = Vec::new();
    if let Some(first) = iter.next() {
        parts.push(first.to_string());
    }
    if let Some(second) = iter.next() {
        parts.push(second.to_string());
    }
    let rest: Vec<&str> = iter.collect();
    if !rest.is_empty() {
        parts.push(rest.join(" "));
    }
    parts
}

fn validate_filter(
    frame: &Frame,
    column: &str,
    op: &str,
    lineno: usize,
    command: &str,
) -> std::result::Result<usize, GridError> {
    let index = check_column(frame, column, lineno)?;
    if SYMBOL_OPS.contains(&op) {
        return Err(GridError::new(
            lineno,
            format!("{command} requires word operator (eq/neq/gt/lt/gte/lte), got '{op}'"),
        ));
    }
    if !VALID_OPS.contains(&op) {
        return Err(GridError::new(
            lineno,
            format!("{command} unknown operator '{op}'. Valid: eq, neq, gt, lt, gte, lte"),
        ));
    }
    Ok(index)
}

fn cmd_filter(
    frame: &Frame,
    args: &str,
    lineno: usize,
    command: &str,
    keep: bool,
) -> std::result::Result<Frame, GridError> {
    require_data(frame, command, lineno)?;
    let parts = tokenize_filter(args);
    if parts.len() < 3 {
        return Err(GridError::new(lineno, format!("{command} syntax: {command} column op value")));
    }
    let (column, op, value) = (&parts[0], parts[1].as_str(), &parts[2]);
    let index = validate_filter(frame, column, op, lineno, command)?;
    let rows = frame
        .rows
        .iter()
        .filter(|row| compare(&row[index], op, value) == keep)
        .cloned()
        .collect();
    Ok(Frame {
        columns: frame.columns.clone(),
        rows,
    })
}

fn cmd_tally(frame: &Frame, args: &str, lineno: usize) -> std::result::Result<Frame, GridError> {
    static TALLY_HEAD: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^(\S+)\s*->\s*(.*)$").unwrap()
    });
    static AGG_SPEC: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^(\w+)\s*=\s*(\w+)\((\w+)\)").unwrap()
    });
    const SYNTAX: &str = "TALLY syntax: TALLY group_col -> alias=func(agg_col). Got invalid format.";

    require_data(frame, "TALLY", lineno)?;
    let Some(head) = TALLY_HEAD.captures(args.trim()) else {
        return Err(GridError::new(lineno, SYNTAX));
    };
    let group_col = head[1].to_string();
    let group_index = check_column(frame, &group_col, lineno)?;
    let agg_str = head[2].trim().to_string();

    let mut specs: Vec<(String, String, usize)> = Vec::new();
    for part in agg_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some(capture) = AGG_SPEC.captures(part) else {
            return Err(GridError::new(lineno, SYNTAX));
        };
        let matched_len = capture.get(0).map_or(0, |whole| whole.end());
        let remainder = part[matched_len..].trim();
        if !remainder.is_empty() {
            return Err(GridError::new(
                lineno,
                format!(
                    "TALLY: unexpected text after '{}': '{remainder}'. Separate multiple aggregations with commas, e.g.: TALLY {group_col} -> a=sum(x), b=count(y)",
                    &capture[0],
                ),
            ));
        }
        let (alias, func, agg_col) = (capture[1].to_string(), capture[2].to_string(), &capture[3]);
        if func != func.to_lowercase() {
            return Err(GridError::new(
                lineno,
                format!("Unknown function '{func}'. Use lowercase: {}", func.to_lowercase()),
            ));
        }
        if !AGG_FUNCS.contains(&func.as_str()) {
            return Err(GridError::new(
                lineno,
                format!("Unknown function '{func}'. Available: sum, count, avg, min, max"),
            ));
        }
        let agg_index = check_column(frame, agg_col, lineno)?;
        specs.push((alias, func, agg_index));
    }

    // Group in first-seen key order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<&Vec<String>>> = BTreeMap::new();
    for row in &frame.rows {
        let key = row[group_index].clone();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }

    let mut columns = vec![group_col];
    for (alias, _, _) in &specs {
        columns.push(alias.clone());
    }
    let mut rows = Vec::new();
    for key in order {
        let group_rows = &groups[&key];
        let mut out = vec![key.clone()];
        for (_, func, agg_index) in &specs {
            let numeric: Vec<f64> = group_rows
                .iter()
                .filter_map(|row| try_float(&row[*agg_index]))
                .collect();
            let cell = match func.as_str() {
                "count" => group_rows.len().to_string(),
                "sum" => format_number(numeric.iter().sum()),
                "avg" => {
                    if numeric.is_empty() {
                        "0".to_string()
                    } else {
                        format_number(numeric.iter().sum::<f64>() / numeric.len() as f64)
                    }
                }
                "min" => numeric
                    .iter()
                    .copied()
                    .fold(None::<f64>, |acc, value| {
                        Some(acc.map_or(value, |current| current.min(value)))
                    })
                    .map(format_number)
                    .unwrap_or_default(),
                _ => numeric
                    .iter()
                    .copied()
                    .fold(None::<f64>, |acc, value| {
                        Some(acc.map_or(value, |current| current.max(value)))
                    })
                    .map(format_number)
                    .unwrap_or_default(),
            };
            out.push(cell);
        }
        rows.push(out);
    }
    Ok(Frame { columns, rows })
}

fn cmd_rank(frame: &Frame, args: &str, lineno: usize) -> std::result::Result<Frame, GridError> {
    require_data(frame, "RANK", lineno)?;
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(GridError::new(lineno, "RANK syntax: RANK column asc|desc"));
    }
    let index = check_column(frame, parts[0], lineno)?;
    let direction = parts[1].to_lowercase();
    if direction != "asc" && direction != "desc" {
        return Err(GridError::new(
            lineno,
            format!("RANK direction must be 'asc' or 'desc', got '{}'", parts[1]),
        ));
    }
    let mut rows = frame.rows.clone();
    rows.sort_by(|a, b| {
        let ordering = match (try_float(&a[index]), try_float(&b[index])) {
            (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal),
            _ => a[index].cmp(&b[index]),
        };
        if direction == "desc" { ordering.reverse() } else { ordering }
    });
    Ok(Frame {
        columns: frame.columns.clone(),
        rows,
    })
}

fn cmd_pick(frame: &Frame, args: &str, lineno: usize) -> std::result::Result<Frame, GridError> {
    require_data(frame, "PICK", lineno)?;
    let mut indexes = Vec::new();
    let mut columns = Vec::new();
    for column in args.split(',') {
        let column = column.trim();
        let index = check_column(frame, column, lineno)?;
        indexes.push(index);
        columns.push(column.to_string());
    }
    let rows = frame
        .rows
        .iter()
        .map(|row| indexes.iter().map(|index| row[*index].clone()).collect())
        .collect();
    Ok(Frame { columns, rows })
}

/// Minimal arithmetic evaluator with `*`/`/` precedence over `+`/`-`.
fn eval_arithmetic(tokens: &[f64], ops: &[char]) -> f64 {
    // First pass: fold multiplication and division.
    let mut values = vec![tokens[0]];
    let mut pending: Vec<char> = Vec::new();
    for (op, value) in ops.iter().zip(tokens.iter().skip(1)) {
        match op {
            '*' => {
                let last = values.len() - 1;
                values[last] *= value;
            }
            '/' => {
                let last = values.len() - 1;
                values[last] = if *value == 0.0 { 0.0 } else { values[last] / value };
            }
            other => {
                pending.push(*other);
                values.push(*value);
            }
        }
    }
    let mut total = values[0];
    for (op, value) in pending.iter().zip(values.iter().skip(1)) {
        if *op == '+' {
            total += value;
        } else {
            total -= value;
        }
    }
    total
}

fn cmd_derive(frame: &Frame, args: &str, lineno: usize) -> std::result::Result<Frame, GridError> {
    static DERIVE_HEAD: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^(\w+)\s*=\s*(.*)$").unwrap()
    });
    static EXPR_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"[\w.]+|[+\-*/]").unwrap()
    });

    require_data(frame, "DERIVE", lineno)?;
    let Some(head) = DERIVE_HEAD.captures(args.trim()) else {
        return Err(GridError::new(lineno, "DERIVE syntax: DERIVE new_col = expression"));
    };
    let new_col = head[1].to_string();
    let expr = head[2].trim().to_string();
    let tokens: Vec<String> = EXPR_TOKEN
        .find_iter(&expr)
        .map(|token| token.as_str().to_string())
        .collect();
    if tokens.is_empty() {
        return Err(GridError::new(lineno, "DERIVE expression is empty."));
    }

    enum Operand {
        Column(usize),
        Literal(f64),
        Op(char),
    }
    let mut plan: Vec<Operand> = Vec::new();
    for token in &tokens {
        if token.len() == 1 && "+-*/".contains(token.as_str()) {
            plan.push(Operand::Op(token.chars().next().unwrap_or('+')));
        } else if let Some(index) = frame.column_index(token) {
            plan.push(Operand::Column(index));
        } else if let Some(value) = try_float(token) {
            plan.push(Operand::Literal(value));
        } else {
            return Err(GridError::new(
                lineno,
                format!(
                    "Column '{token}' not found. Available: {}",
                    available_columns_text(frame)
                ),
            ));
        }
    }

    let mut columns = frame.columns.clone();
    let replace_index = frame.column_index(&new_col);
    if replace_index.is_none() {
        columns.push(new_col.clone());
    }
    let mut rows = Vec::new();
    for row in &frame.rows {
        let mut values: Vec<f64> = Vec::new();
        let mut ops: Vec<char> = Vec::new();
        for operand in &plan {
            match operand {
                Operand::Column(index) => values.push(try_float(&row[*index]).unwrap_or(0.0)),
                Operand::Literal(value) => values.push(*value),
                Operand::Op(op) => ops.push(*op),
            }
        }
        let result = if values.is_empty() {
            0.0
        } else {
            eval_arithmetic(&values, &ops)
        };
        let mut new_row = row.clone();
        match replace_index {
            Some(index) => new_row[index] = format_number(result),
            None => new_row.push(format_number(result)),
        }
        rows.push(new_row);
    }
    Ok(Frame { columns, rows })
}

fn cmd_merge(
    frame: &Frame,
    args: &str,
    workdir: &Path,
    lineno: usize,
) -> std::result::Result<Frame, GridError> {
    static MERGE_ON: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?i)^\s*ON\s+(\w+)").unwrap()
    });

    require_data(frame, "MERGE", lineno)?;
    let Some((path, rest)) = parse_quoted(args) else {
        return Err(GridError::new(
            lineno,
            "MERGE path must be quoted. Use: MERGE \"file.csv\" ON column",
        ));
    };
    let Some(on) = MERGE_ON.captures(&rest) else {
        return Err(GridError::new(lineno, "MERGE syntax: MERGE \"file.csv\" ON column"));
    };
    let join_col = on[1].to_string();
    let left_index = check_column(frame, &join_col, lineno)?;

    let right = read_csv_file(workdir, &path, lineno)?;
    if right.rows.is_empty() {
        return Ok(frame.clone());
    }
    let Some(right_index) = right.column_index(&join_col) else {
        return Err(GridError::new(
            lineno,
            format!(
                "Column '{join_col}' not found in '{path}'. Available: {}",
                right.columns.join(", ")
            ),
        ));
    };

    let mut right_by_key: BTreeMap<String, Vec<&Vec<String>>> = BTreeMap::new();
    for row in &right.rows {
        right_by_key.entry(row[right_index].clone()).or_default().push(row);
    }

    let extra_columns: Vec<(usize, String)> = right
        .columns
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != right_index)
        .map(|(index, name)| (index, name.clone()))
        .collect();
    let mut columns = frame.columns.clone();
    for (_, name) in &extra_columns {
        if !columns.contains(name) {
            columns.push(name.clone());
        }
    }

    let mut rows = Vec::new();
    for left_row in &frame.rows {
        let Some(matches) = right_by_key.get(&left_row[left_index]) else {
            continue;
        };
        for right_row in matches {
            let mut merged: Vec<String> = Vec::with_capacity(columns.len());
            for (position, column) in columns.iter().enumerate() {
                if position < frame.columns.len() {
                    // Right side overwrites shared columns other than the key.
                    let overwrite = extra_columns
                        .iter()
                        .find(|(_, name)| name == column)
                        .map(|(index, _)| right_row[*index].clone());
                    merged.push(overwrite.unwrap_or_else(|| left_row[position].clone()));
                } else {
                    let value = extra_columns
                        .iter()
                        .find(|(_, name)| name == column)
                        .map(|(index, _)| right_row[*index].clone())
                        .unwrap_or_default();
                    merged.push(value);
                }
            }
            rows.push(merged);
        }
    }
    Ok(Frame { columns, rows })
}

fn cmd_show(frame: &Frame, args: &str, lineno: usize, output: &mut String) -> std::result::Result<(), GridError> {
    if frame.is_empty() {
        output.push_str("(empty)\n");
        return Ok(());
    }
    let args = args.trim();
    let limit = if args.is_empty() {
        None
    } else {
        match args.parse::<usize>() {
            Ok(limit) => Some(limit),
            Err(_) => {
                return Err(GridError::new(
                    lineno,
                    format!("SHOW takes an optional integer (row count), got '{args}'"),
                ));
            }
        }
    };
    output.push_str(&frame.to_csv(limit));
    Ok(())
}

/// Execute a gridtool script against a working directory.
///
/// Returns the accumulated `SHOW` output, or the first error (with its
/// style already resolved: explicit style, or the per-command mixed map).
pub fn run_gridtool_script(
    workdir: &Path,
    input: &str,
    style: ErrorStyle,
) -> std::result::Result<String, String> {
    let mut frame = Frame::default();
    let mut output = String::new();

    for (lineno0, raw_line) in input.lines().enumerate() {
        let lineno = lineno0 + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or_default().to_uppercase();
        let args = parts.next().unwrap_or_default();

        let command_style = if style == ErrorStyle::Mixed {
            mixed_style_for(&command)
        } else {
            style
        };

        if !COMMANDS.contains(&command.as_str()) {
            let suggestion = SQL_MISTAKES
                .iter()
                .find(|(mistake, _)| *mistake == command)
                .map(|(_, fix)| *fix);
            let message = match suggestion {
                Some(fix) => format!("Unknown command '{command}'. Did you mean '{fix}'?"),
                None => format!(
                    "Unknown command '{command}'. Valid commands: {}",
                    COMMANDS.join(", ")
                ),
            };
            return Err(GridError::new(lineno, message).render(command_style));
        }

        let step = match command.as_str() {
            "LOAD" => match parse_quoted(args) {
                Some((path, _)) => read_csv_file(workdir, &path, lineno),
                None => Err(GridError::new(
                    lineno,
                    "LOAD path must be quoted. Use: LOAD \"filename.csv\"",
                )),
            },
            "KEEP" => cmd_filter(&frame, args, lineno, "KEEP", true),
            "TOSS" => cmd_filter(&frame, args, lineno, "TOSS", false),
            "TALLY" => cmd_tally(&frame, args, lineno),
            "RANK" => cmd_rank(&frame, args, lineno),
            "PICK" => cmd_pick(&frame, args, lineno),
            "DERIVE" => cmd_derive(&frame, args, lineno),
            "MERGE" => cmd_merge(&frame, args, workdir, lineno),
            _ => {
                if let Err(error) = cmd_show(&frame, args, lineno, &mut output) {
                    return Err(error.render(command_style));
                }
                continue;
            }
        };
        match step {
            Ok(next) => frame = next,
            Err(error) => return Err(error.render(command_style)),
        }
    }
    Ok(output.trim_end().to_string())
}

/// Adapter for the gridtool DSL.
#[derive(Debug, Clone)]
pub struct GridtoolAdapter {
    aliases: StandardAliases,
    style: ErrorStyle,
    docs_root: Option<PathBuf>,
}

impl GridtoolAdapter {
    #[must_use]
    pub fn new(style: ErrorStyle, docs_root: Option<PathBuf>) -> Self {
        GridtoolAdapter {
            aliases: StandardAliases::for_executor(
                RUN_GRIDTOOL_TOOL_NAME,
                "Execute gridtool commands against CSV data. Pass commands as a string.",
            ),
            style,
            docs_root,
        }
    }
}

#[async_trait]
impl DomainAdapter for GridtoolAdapter {
    fn name(&self) -> &str {
        "gridtool"
    }

    fn executor_tool_name(&self) -> &str {
        RUN_GRIDTOOL_TOOL_NAME
    }

    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec> {
        self.aliases.tool_defs(
            json!({
                "type": "object",
                "properties": {
                    "commands": {"type": "string", "description": "gridtool commands to execute (one per line)."}
                },
                "required": ["commands"],
                "additionalProperties": false,
            }),
            fixture_refs,
            opaque,
        )
    }

    fn build_alias_map(&self, opaque: bool) -> BTreeMap<String, String> {
        self.aliases.alias_map(opaque)
    }

    async fn prepare_workspace(&self, task_dir: &Path, work_dir: &Path) -> Result<DomainWorkspace> {
        std::fs::create_dir_all(work_dir)?;
        let mut fixture_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut csv_paths: Vec<PathBuf> = std::fs::read_dir(task_dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|extension| extension == "csv"))
            .collect();
        csv_paths.sort();
        for csv_path in csv_paths {
            let name = csv_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            // The engine reads from work_dir; show_fixture reads originals.
            std::fs::copy(&csv_path, work_dir.join(&name))?;
            fixture_paths.insert(name, csv_path);
        }
        let task_md = task_dir.join("task.md");
        if task_md.exists() {
            fixture_paths.insert("task.md".into(), task_md);
        }
        debug!(fixtures = fixture_paths.len(), "gridtool workspace prepared");
        Ok(DomainWorkspace {
            task_id: task_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            task_dir: task_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            fixture_paths,
        })
    }

    async fn execute(
        &self,
        tool_name: &str,
        tool_input: &Value,
        workspace: &DomainWorkspace,
    ) -> ToolResult {
        if tool_name != RUN_GRIDTOOL_TOOL_NAME {
            return ToolResult::err(format!("unknown tool {tool_name:?} for gridtool domain"));
        }
        let Some(commands) = tool_input.get("commands").and_then(Value::as_str) else {
            return ToolResult::err("run_gridtool requires string commands");
        };
        match run_gridtool_script(&workspace.work_dir, commands, self.style) {
            Ok(output) => {
                if output.is_empty() {
                    ToolResult::ok("(ok)")
                } else {
                    ToolResult::ok(output)
                }
            }
            Err(error) => ToolResult::err(error),
        }
    }

    async fn capture_final_state(&self, _workspace: &DomainWorkspace) -> String {
        // Output goes to stdout per SHOW; the event log is the observable
        // state.
        "See event log for gridtool SHOW outputs.".to_string()
    }

    fn system_prompt_fragment(&self) -> String {
        concat!(
            "You are controlling a gridtool CLI environment.\n",
            "gridtool is a data processing tool with its own syntax.\n",
            "You MUST read the skill doc before using it - the syntax is NOT SQL.\n",
            "Rules:\n",
            "- Use run_gridtool to execute gridtool commands.\n",
            "- You must read at least one routed skill with read_skill before run_gridtool.\n",
            "- Use read_skill whenever routed skill summaries are insufficient for exact execution.\n",
            "- Use show_fixture to inspect fixture files.\n",
            "- gridtool commands: LOAD, KEEP, TOSS, TALLY, RANK, PICK, DERIVE, MERGE, SHOW.\n",
            "- Do NOT use SQL syntax - gridtool is completely different.\n",
        )
        .to_string()
    }

    fn quality_keywords(&self) -> &Regex {
        &GRIDTOOL_KEYWORDS
    }

    fn docs_manifest(&self) -> Vec<DomainDoc> {
        docs_from_root(self.docs_root.as_deref(), "gridtool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir_with_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fixture.csv"),
            "region,amount\nnorth,5\nsouth,4\nnorth,8\nsouth,5\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn load_tally_rank_show_pipeline() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nTALLY region -> total=sum(amount)\nRANK total desc\nSHOW\n";
        let output = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap();
        assert_eq!(output, "region,total\nnorth,13.0\nsouth,9.0");
    }

    #[test]
    fn keep_filters_with_word_operators() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nKEEP amount gte 5\nSHOW\n";
        let output = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap();
        assert_eq!(output, "region,amount\nnorth,5\nnorth,8\nsouth,5");
    }

    #[test]
    fn symbol_operators_are_rejected_with_guidance() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nKEEP amount >= 5\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("ERROR at line 2"));
        assert!(error.contains("word operator"));
    }

    #[test]
    fn tally_without_arrow_reports_syntax() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nTALLY region total=sum(amount)\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("TALLY syntax: TALLY group_col -> alias=func(agg_col)"));
    }

    #[test]
    fn sql_commands_get_suggestions() {
        let dir = workdir_with_fixture();
        let error =
            run_gridtool_script(dir.path(), "SELECT region\n", ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("Did you mean 'PICK'?"));
    }

    #[test]
    fn cryptic_mode_strips_hints() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nTALLY region total=sum(amount)\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::Cryptic).unwrap_err();
        assert_eq!(error, "ERROR at line 2: TALLY: syntax error.");
    }

    #[test]
    fn semi_helpful_mode_hints_without_full_syntax() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nTALLY region total=sum(amount)\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::SemiHelpful).unwrap_err();
        assert!(error.contains("expected arrow operator '->'"));
        assert!(!error.contains("alias=func"));
    }

    #[test]
    fn mixed_mode_varies_by_command() {
        assert_eq!(mixed_style_for("KEEP"), ErrorStyle::Cryptic);
        assert_eq!(mixed_style_for("TALLY"), ErrorStyle::SemiHelpful);
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nKEEP amount banana 5\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::Mixed).unwrap_err();
        assert_eq!(error, "ERROR at line 2: KEEP: invalid operator.");
    }

    #[test]
    fn unknown_column_lists_available() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nKEEP kingdom eq north\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("Column 'kingdom' not found. Available: region, amount"));
    }

    #[test]
    fn uppercase_functions_are_rejected() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nTALLY region -> total=SUM(amount)\n";
        let error = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("Unknown function 'SUM'. Use lowercase: sum"));
    }

    #[test]
    fn derive_respects_arithmetic_precedence() {
        let dir = workdir_with_fixture();
        let script = "LOAD \"fixture.csv\"\nDERIVE doubled = amount * 2 + 1\nPICK region, doubled\nSHOW 1\n";
        let output = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap();
        assert_eq!(output, "region,doubled\nnorth,11.0");
    }

    #[test]
    fn merge_joins_on_column() {
        let dir = workdir_with_fixture();
        std::fs::write(dir.path().join("names.csv"), "region,label\nnorth,N\nsouth,S\n").unwrap();
        let script = "LOAD \"fixture.csv\"\nKEEP amount eq 8\nMERGE \"names.csv\" ON region\nSHOW\n";
        let output = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap();
        assert_eq!(output, "region,amount,label\nnorth,8,N");
    }

    #[test]
    fn load_requires_quoted_path_and_existing_file() {
        let dir = workdir_with_fixture();
        let unquoted =
            run_gridtool_script(dir.path(), "LOAD fixture.csv\n", ErrorStyle::Helpful).unwrap_err();
        assert!(unquoted.contains("LOAD path must be quoted"));
        let missing =
            run_gridtool_script(dir.path(), "LOAD \"nope.csv\"\n", ErrorStyle::Helpful).unwrap_err();
        assert!(missing.contains("File not found: \"nope.csv\""));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let dir = workdir_with_fixture();
        let script = "# comment\n\nLOAD \"fixture.csv\"\nSHOW 1\n";
        let output = run_gridtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap();
        assert_eq!(output, "region,amount\nnorth,5");
    }
}
