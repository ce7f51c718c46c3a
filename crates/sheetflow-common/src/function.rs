//! Worksheet-function metadata for tab completion.
//!
//! A sorted name index with prefix search plus argument-type lookup that
//! understands variadic/repeating argument groups. The UI consumes this;
//! the engine only ships the catalog.

use once_cell::sync::Lazy;

/// Coarse argument type used by completion hints.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArgKind {
    Range,
    Value,
    Number,
    Text,
    Boolean,
    Any,
}

impl ArgKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "range" => Self::Range,
            "value" => Self::Value,
            "number" => Self::Number,
            "string" | "text" => Self::Text,
            "boolean" | "logical" => Self::Boolean,
            "" | "_" | "any" => Self::Any,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub optional: bool,
    /// Marks the start of a group that cycles past the declared list.
    pub repeating: bool,
}

impl ArgSpec {
    pub const fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            optional: false,
            repeating: false,
        }
    }

    pub const fn optional(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            optional: true,
            repeating: false,
        }
    }

    pub const fn repeating(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            optional: true,
            repeating: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionSpec {
    /// Uppercase canonical name.
    pub name: &'static str,
    pub description: &'static str,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub args: &'static [ArgSpec],
}

impl FunctionSpec {
    /// Resolve the declared argument for position `index`, cycling the
    /// repeating group when the position runs past the declared list.
    pub fn arg_at(&self, index: usize) -> Option<&ArgSpec> {
        if index < self.args.len() {
            return Some(&self.args[index]);
        }
        let repeat_start = self.args.iter().position(|a| a.repeating)?;
        let group = &self.args[repeat_start..];
        if group.is_empty() {
            return None;
        }
        if let Some(max) = self.max_args {
            if index >= max {
                return None;
            }
        }
        Some(&group[(index - repeat_start) % group.len()])
    }
}

/// Sorted function index supporting exact lookup and prefix search.
#[derive(Debug, Clone, Default)]
pub struct FunctionIndex {
    specs: Vec<FunctionSpec>,
}

impl FunctionIndex {
    pub fn new(mut specs: Vec<FunctionSpec>) -> Self {
        specs.sort_by(|a, b| a.name.cmp(b.name));
        specs.dedup_by(|a, b| a.name == b.name);
        Self { specs }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        let upper = name.to_ascii_uppercase();
        self.specs
            .binary_search_by(|s| s.name.cmp(upper.as_str()))
            .ok()
            .map(|i| &self.specs[i])
    }

    /// All specs whose name starts with `prefix` (case-insensitive),
    /// in sorted order. Binary-searches the boundaries rather than
    /// scanning the catalog.
    pub fn prefix_search(&self, prefix: &str) -> &[FunctionSpec] {
        let upper = prefix.to_ascii_uppercase();
        let lo = self.specs.partition_point(|s| s.name < upper.as_str());
        let hi = self.specs[lo..]
            .partition_point(|s| s.name.starts_with(upper.as_str()))
            + lo;
        &self.specs[lo..hi]
    }
}

/// Builtin catalog the UI seeds from.
pub static BUILTIN_FUNCTIONS: Lazy<FunctionIndex> = Lazy::new(|| {
    use ArgKind::*;
    FunctionIndex::new(vec![
        FunctionSpec {
            name: "AVERAGE",
            description: "Arithmetic mean of its arguments",
            min_args: 1,
            max_args: None,
            args: const { &[ArgSpec::repeating("number", Range)] },
        },
        FunctionSpec {
            name: "CONCAT",
            description: "Joins text values",
            min_args: 1,
            max_args: None,
            args: const { &[ArgSpec::repeating("text", Value)] },
        },
        FunctionSpec {
            name: "COUNT",
            description: "Counts numeric values",
            min_args: 1,
            max_args: None,
            args: const { &[ArgSpec::repeating("value", Range)] },
        },
        FunctionSpec {
            name: "IF",
            description: "Conditional value",
            min_args: 2,
            max_args: Some(3),
            args: const { &[
                ArgSpec::required("condition", Boolean),
                ArgSpec::required("value_if_true", Value),
                ArgSpec::optional("value_if_false", Value),
            ] },
        },
        FunctionSpec {
            name: "INDEX",
            description: "Value at a position in a range",
            min_args: 2,
            max_args: Some(3),
            args: const { &[
                ArgSpec::required("array", Range),
                ArgSpec::required("row", Number),
                ArgSpec::optional("column", Number),
            ] },
        },
        FunctionSpec {
            name: "MATCH",
            description: "Position of a value in a range",
            min_args: 2,
            max_args: Some(3),
            args: const { &[
                ArgSpec::required("lookup_value", Value),
                ArgSpec::required("lookup_array", Range),
                ArgSpec::optional("match_type", Number),
            ] },
        },
        FunctionSpec {
            name: "MAX",
            description: "Largest value",
            min_args: 1,
            max_args: None,
            args: const { &[ArgSpec::repeating("number", Range)] },
        },
        FunctionSpec {
            name: "MIN",
            description: "Smallest value",
            min_args: 1,
            max_args: None,
            args: const { &[ArgSpec::repeating("number", Range)] },
        },
        FunctionSpec {
            name: "SUM",
            description: "Adds its arguments",
            min_args: 1,
            max_args: None,
            args: const { &[ArgSpec::repeating("number", Range)] },
        },
        FunctionSpec {
            name: "SUMIF",
            description: "Adds cells matching a criterion",
            min_args: 2,
            max_args: Some(3),
            args: const { &[
                ArgSpec::required("range", Range),
                ArgSpec::required("criteria", Value),
                ArgSpec::optional("sum_range", Range),
            ] },
        },
        FunctionSpec {
            name: "TEXTJOIN",
            description: "Joins text with a delimiter",
            min_args: 3,
            max_args: None,
            args: const { &[
                ArgSpec::required("delimiter", Text),
                ArgSpec::required("ignore_empty", Boolean),
                ArgSpec::repeating("text", Value),
            ] },
        },
        FunctionSpec {
            name: "VLOOKUP",
            description: "Vertical table lookup",
            min_args: 3,
            max_args: Some(4),
            args: const { &[
                ArgSpec::required("lookup_value", Value),
                ArgSpec::required("table_array", Range),
                ArgSpec::required("col_index", Number),
                ArgSpec::optional("range_lookup", Boolean),
            ] },
        },
    ])
});
