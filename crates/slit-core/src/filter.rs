//! Ordered predicates deciding which decoded records become events.
//!
//! Every filter answers a single question: should this record be dropped? "Select"
//! style filters drop whatever they don't match. A pipeline stops at the first
//! filter claiming the drop, so cheap checks should be listed before expensive ones.

use std::fmt;

use thiserror::Error;

/// A pure predicate over a decoded record.
pub trait Filter<T>: fmt::Debug + Send + Sync {
    /// Returns true if the record must be discarded.
    fn drops(&self, record: &T) -> bool;
}

/// Immutable, ordered list of filters, built once from configuration.
#[derive(Debug, Clone)]
pub struct FilterPipeline<F> {
    filters: Vec<F>,
}

impl<F> Default for FilterPipeline<F> {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
        }
    }
}

impl<F> FilterPipeline<F> {
    pub fn new(filters: Vec<F>) -> Self {
        Self { filters }
    }

    pub fn filters(&self) -> &[F] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The filter claiming the drop, if any.
    pub fn first_drop<T>(&self, record: &T) -> Option<&F>
    where
        F: Filter<T>,
    {
        self.filters.iter().find(|filter| filter.drops(record))
    }

    pub fn accepts<T>(&self, record: &T) -> bool
    where
        F: Filter<T>,
    {
        self.first_drop(record).is_none()
    }
}

/// Error parsing a filter from its configuration syntax, `name` or `name=value`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFilterError {
    #[error("unknown filter {0}")]
    Unknown(String),
    #[error("filter {0} needs a value")]
    MissingValue(String),
    #[error("invalid value {value} for filter {filter}: {reason}")]
    InvalidValue {
        filter: String,
        value: String,
        reason: String,
    },
}

/// Split `name=value` filter syntax. The value is `None` for bare names.
pub fn split_filter(filter: &str) -> (&str, Option<&str>) {
    match filter.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.trim())),
        None => (filter.trim(), None),
    }
}

impl<F> From<Vec<F>> for FilterPipeline<F> {
    fn from(filters: Vec<F>) -> Self {
        Self::new(filters)
    }
}
