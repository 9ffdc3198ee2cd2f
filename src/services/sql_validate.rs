//! Draft-SQL validation: single read-only statement, structural lint, and
//! the row-ceiling rewrite. This is a guardrail, not a SQL parser.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy)]
pub struct ValidationPolicy {
    /// Reject statements with write effects.
    pub read_only: bool,
    /// Structural lint (balanced quotes/parens). Profiles can opt out via
    /// the `rule_validation` feature.
    pub lint: bool,
    /// Row ceiling enforced with a LIMIT rewrite.
    pub max_rows: u64,
}

static WRITE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(insert|update|delete|drop|create|alter|truncate|grant|revoke|merge|replace|call|set|use|copy|vacuum|attach)\b",
    )
    .expect("static regex")
});

static LEADING_SELECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(select|with|show|describe|explain)\b").expect("static regex"));

static TRAILING_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blimit\s+(\d+)\s*(offset\s+\d+\s*)?$").expect("static regex"));

/// Validate a draft statement and return it with the row ceiling applied.
pub fn validate(sql: &str, policy: &ValidationPolicy) -> EngineResult<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation("empty SQL statement"));
    }

    if contains_statement_separator(trimmed) {
        return Err(EngineError::validation("multi-statement SQL is not allowed"));
    }

    if policy.read_only {
        if WRITE_KEYWORD.is_match(trimmed) {
            return Err(EngineError::validation("write statements are not allowed in this scene"));
        }
        if !LEADING_SELECT.is_match(trimmed) {
            return Err(EngineError::validation("only SELECT-style statements are allowed"));
        }
    }

    if policy.lint {
        lint_structure(trimmed)?;
    }

    Ok(apply_row_ceiling(trimmed, policy.max_rows))
}

/// A `;` outside quote context means a second statement.
fn contains_statement_separator(sql: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                // Doubled quote is an escaped literal quote.
                if in_single && chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_single = !in_single;
                }
            },
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => return true,
            _ => {},
        }
    }
    false
}

fn lint_structure(sql: &str) -> EngineResult<()> {
    let mut depth = 0i64;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                if in_single && chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_single = !in_single;
                }
            },
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => {
                depth -= 1;
                if depth < 0 {
                    return Err(EngineError::validation("unbalanced parentheses in SQL"));
                }
            },
            _ => {},
        }
    }
    if depth != 0 {
        return Err(EngineError::validation("unbalanced parentheses in SQL"));
    }
    if in_single || in_double {
        return Err(EngineError::validation("unterminated string literal in SQL"));
    }
    Ok(())
}

/// Append or tighten the trailing LIMIT so no statement exceeds the
/// ceiling. An existing lower LIMIT is kept.
fn apply_row_ceiling(sql: &str, max_rows: u64) -> String {
    if max_rows == 0 {
        return sql.to_string();
    }

    if let Some(caps) = TRAILING_LIMIT.captures(sql) {
        let existing: u64 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(u64::MAX);
        if existing <= max_rows {
            return sql.to_string();
        }
        return TRAILING_LIMIT.replace(sql, format!("LIMIT {}", max_rows)).into_owned();
    }

    format!("{} LIMIT {}", sql, max_rows)
}
