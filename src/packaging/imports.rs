//! Import-graph extraction and manifest inference.
//!
//! The source is reduced to logical lines: string literals are blanked,
//! comments dropped, and bracketed or backslash-continued lines joined. Each
//! logical line is split into simple statements and matched against the two
//! import forms:
//!
//! ```text
//! import a.b as c, d        → a, d
//! from e.f import (g, h)    → e
//! from . import x           → (relative, ignored)
//! ```
//!
//! Imports nested in function bodies or after a compound-statement colon
//! (`try: import x`) are collected as well.

use std::collections::BTreeSet;

use crate::constants::{BASE_RUNTIME_REQUIREMENT, PREINSTALLED_MODULES};

/// Builds the manifest: the base requirement, then every third-party
/// top-level module sorted lexicographically, newline-separated.
pub fn infer_manifest(source: &str) -> String {
    let mut lines = vec![BASE_RUNTIME_REQUIREMENT.to_string()];
    lines.extend(
        top_level_imports(source)
            .into_iter()
            .filter(|m| PREINSTALLED_MODULES.binary_search(&m.as_str()).is_err()),
    );
    lines.join("\n")
}

/// Top-level module names of every absolute import in `source`.
pub fn top_level_imports(source: &str) -> BTreeSet<String> {
    let mut modules = BTreeSet::new();
    for line in logical_lines(source) {
        for statement in line.split(';') {
            collect_statement(statement, &mut modules);
        }
    }
    modules
}

fn collect_statement(statement: &str, modules: &mut BTreeSet<String>) {
    let statement = statement.trim();
    if let Some(rest) = strip_keyword(statement, "import") {
        for alias in rest.split(',') {
            if let Some(name) = alias.split_whitespace().next() {
                insert_top_level(name, modules);
            }
        }
        return;
    }
    if let Some(rest) = strip_keyword(statement, "from") {
        let mut words = rest.split_whitespace();
        if let (Some(module), Some("import")) = (words.next(), words.next()) {
            if !module.starts_with('.') {
                insert_top_level(module, modules);
            }
        }
        return;
    }
    // `if cond: import x`, `try: import x`
    if let Some((_, tail)) = statement.split_once(':') {
        collect_statement(tail, modules);
    }
}

fn strip_keyword<'a>(statement: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = statement.strip_prefix(keyword)?;
    if rest.starts_with(|c: char| c.is_whitespace()) {
        Some(rest)
    } else {
        None
    }
}

fn insert_top_level(dotted: &str, modules: &mut BTreeSet<String>) {
    let top = dotted.split('.').next().unwrap_or_default();
    if is_identifier(top) {
        modules.insert(top.to_string());
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// Splits source into logical lines with strings blanked and comments removed.
fn logical_lines(source: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut depth: usize = 0;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '\'' | '"' => {
                skip_string(c, &mut chars);
                current.push_str("\"\"");
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '\\' if chars.peek() == Some(&'\n') => {
                chars.next();
                current.push(' ');
            }
            '\n' if depth > 0 => current.push(' '),
            '\n' => lines.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        lines.push(current);
    }
    lines
}

/// Consumes a string literal whose opening quote `quote` was just read.
fn skip_string<I: Iterator<Item = char>>(quote: char, chars: &mut std::iter::Peekable<I>) {
    let triple = if chars.peek() == Some(&quote) {
        chars.next();
        if chars.peek() == Some(&quote) {
            chars.next();
            true
        } else {
            // empty literal: '' or ""
            return;
        }
    } else {
        false
    };

    let mut run = 0;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
                run = 0;
            }
            c if c == quote => {
                run += 1;
                if !triple || run == 3 {
                    return;
                }
            }
            '\n' if !triple => return,
            _ => run = 0,
        }
    }
}
