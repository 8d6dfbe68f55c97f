//! Test target filtering.
//!
//! Test targets are short clauses in the syntax the Android instrumentation
//! runner understands, for example `class com.example.LoginTest#testLogin`
//! or `notAnnotation com.example.Flaky`. A [`TestFilter`] is compiled from a
//! list of such clauses and answers one question per test: should it run?
//!
//! # Semantics
//!
//! | Clause | Effect |
//! |--------|--------|
//! | `class A,B#m` | include every test of `A` and method `m` of `B` |
//! | `notClass A,B#m` | exclude the same |
//! | `package com.example` | include classes under `com.example.` |
//! | `notPackage com.example` | exclude the same |
//! | `annotation x.Y` | include tests carrying `x.Y` |
//! | `notAnnotation x.Y` | exclude the same |
//! | `size small` | include tests annotated `@SmallTest` (androidx, support or legacy) |
//!
//! Include clauses are combined with OR; with no include clause every test is
//! included. Exclude clauses are applied afterwards and always win.
//!
//! Filtering removes a test from consideration entirely. It is independent of
//! `@Ignore`, which routes an included test to the ignored list instead.

use std::fmt;

use crate::dex::Annotation;

/// Result type for filter construction.
pub type FilterResult<T> = Result<T, FilterError>;

/// Errors in test target clauses.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error(
        "Unknown test target type '{kind}' in '{target}' \
         (expected class, notClass, package, notPackage, annotation, notAnnotation or size)"
    )]
    UnknownKind { kind: String, target: String },

    #[error("Test target '{0}' has no values")]
    MissingValues(String),

    #[error("Unknown test size '{0}' (expected small, medium or large)")]
    UnknownSize(String),
}

/// The view of a test that filters operate on.
///
/// Parameterized classes are presented with `method_name: None` and match
/// class-level rules.
#[derive(Debug, Clone, Copy)]
pub struct TestCandidate<'a> {
    pub class_name: &'a str,
    pub method_name: Option<&'a str>,
    pub annotations: &'a [Annotation],
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Class {
        class: String,
        method: Option<String>,
    },
    Package(String),
    /// Matches when any of the names is present.
    Annotation(Vec<String>),
}

impl Rule {
    /// Include direction. A parameterized class runs as a whole, so any
    /// method-level pattern on it selects the class.
    fn matches(&self, candidate: &TestCandidate<'_>) -> bool {
        match self {
            Rule::Class { class, method } => {
                class == candidate.class_name
                    && match (method, candidate.method_name) {
                        (Some(wanted), Some(actual)) => wanted == actual,
                        _ => true,
                    }
            }
            Rule::Package(package) => candidate
                .class_name
                .strip_prefix(package.as_str())
                .is_some_and(|rest| rest.starts_with('.')),
            Rule::Annotation(names) => candidate
                .annotations
                .iter()
                .any(|a| names.iter().any(|n| *n == a.name)),
        }
    }

    /// Exclude direction. Excluding one method never removes a whole
    /// parameterized class.
    fn excludes(&self, candidate: &TestCandidate<'_>) -> bool {
        match (self, candidate.method_name) {
            (Rule::Class { method: Some(_), .. }, None) => false,
            _ => self.matches(candidate),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Class {
                class,
                method: Some(method),
            } => write!(f, "class {class}#{method}"),
            Rule::Class { class, method: None } => write!(f, "class {class}"),
            Rule::Package(package) => write!(f, "package {package}"),
            Rule::Annotation(names) => write!(f, "annotation {}", names.join("|")),
        }
    }
}

fn size_annotations(size: &str) -> FilterResult<Vec<String>> {
    let simple = match size.to_ascii_lowercase().as_str() {
        "small" => "SmallTest",
        "medium" => "MediumTest",
        "large" => "LargeTest",
        _ => return Err(FilterError::UnknownSize(size.to_string())),
    };
    Ok([
        "androidx.test.filters",
        "android.support.test.filters",
        "android.test.suitebuilder.annotation",
    ]
    .iter()
    .map(|package| format!("{package}.{simple}"))
    .collect())
}

/// Splits a `test_targets_for_shard` entry into its `;`-separated clauses.
pub fn split_shard_targets(entry: &str) -> impl Iterator<Item = &str> {
    entry.split(';').map(str::trim).filter(|s| !s.is_empty())
}

/// A compiled include/exclude predicate over tests.
#[derive(Debug, Clone, Default)]
pub struct TestFilter {
    includes: Vec<Rule>,
    excludes: Vec<Rule>,
}

impl TestFilter {
    /// A filter that lets every test through.
    pub fn run_all() -> Self {
        Self::default()
    }

    /// Compiles the configured test targets.
    ///
    /// Every clause of every `test_targets_for_shard` entry takes part in the
    /// filter alongside the plain `test_targets`.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] for unknown clause kinds, empty clauses and
    /// unknown sizes.
    pub fn from_test_targets(
        test_targets: &[String],
        test_targets_for_shard: &[String],
    ) -> FilterResult<Self> {
        let mut filter = Self::default();
        let clauses = test_targets
            .iter()
            .map(String::as_str)
            .chain(test_targets_for_shard.iter().flat_map(|e| split_shard_targets(e)));
        for clause in clauses {
            filter.add_clause(clause)?;
        }
        Ok(filter)
    }

    /// Adds a single clause such as `class com.example.A,com.example.B#m`.
    pub fn add_clause(&mut self, clause: &str) -> FilterResult<()> {
        let clause = clause.trim();
        let (raw_kind, rest) = clause
            .split_once(char::is_whitespace)
            .ok_or_else(|| FilterError::MissingValues(clause.to_string()))?;
        let values: Vec<&str> = rest
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return Err(FilterError::MissingValues(clause.to_string()));
        }

        let (exclude, kind) = match raw_kind.strip_prefix("not") {
            Some(positive) if !positive.is_empty() => (true, positive.to_ascii_lowercase()),
            _ => (false, raw_kind.to_ascii_lowercase()),
        };

        let rules: Vec<Rule> = match (kind.as_str(), exclude) {
            ("class", _) => values
                .iter()
                .map(|v| match v.split_once('#') {
                    Some((class, method)) => Rule::Class {
                        class: class.to_string(),
                        method: Some(method.to_string()),
                    },
                    None => Rule::Class {
                        class: v.to_string(),
                        method: None,
                    },
                })
                .collect(),
            ("package", _) => values
                .iter()
                .map(|v| Rule::Package(v.trim_end_matches('.').to_string()))
                .collect(),
            ("annotation", _) => values
                .iter()
                .map(|v| Rule::Annotation(vec![v.to_string()]))
                .collect(),
            ("size", false) => values
                .iter()
                .map(|v| size_annotations(v).map(Rule::Annotation))
                .collect::<FilterResult<_>>()?,
            _ => {
                return Err(FilterError::UnknownKind {
                    kind: raw_kind.to_string(),
                    target: clause.to_string(),
                });
            }
        };

        if exclude {
            self.excludes.extend(rules);
        } else {
            self.includes.extend(rules);
        }
        Ok(())
    }

    /// Returns `true` if the candidate passes the filter.
    pub fn should_run(&self, candidate: &TestCandidate<'_>) -> bool {
        let included =
            self.includes.is_empty() || self.includes.iter().any(|r| r.matches(candidate));
        included && !self.excludes.iter().any(|r| r.excludes(candidate))
    }

    /// Returns `true` if no clause was configured.
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }
}

impl fmt::Display for TestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "all tests");
        }
        let join = |rules: &[Rule]| {
            rules
                .iter()
                .map(Rule::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "include [{}]", join(&self.includes))?;
        if !self.excludes.is_empty() {
            write!(f, " exclude [{}]", join(&self.excludes))?;
        }
        Ok(())
    }
}
