//! Record filters and pagination.

use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use serde::Serialize;

/// Default page size when the caller gives none.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Predicate over records.
///
/// `title_id` matches exactly, `title` is a case-insensitive substring match
/// and `region` a case-insensitive exact match. Empty strings are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Exact title id.
    pub title_id: Option<String>,
    /// Title substring.
    pub title: Option<String>,
    /// Region code.
    pub region: Option<String>,
}

impl RecordFilter {
    /// Filter on a title id.
    pub fn title_id(title_id: impl Into<String>) -> Self {
        Self {
            title_id: Some(title_id.into()),
            ..Self::default()
        }
    }

    /// Returns true if the record satisfies every set predicate.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(id) = non_empty(&self.title_id) {
            if record.title_id != id {
                return false;
            }
        }
        if let Some(needle) = non_empty(&self.title) {
            if !record
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(region) = non_empty(&self.region) {
            if !record.region.eq_ignore_ascii_case(region) {
                return false;
            }
        }
        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// An offset/limit window over an ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Pagination {
    /// Window starting at `offset`.
    pub fn offset(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Window for a 1-based page number.
    pub fn page(page: usize, limit: usize) -> CoreResult<Self> {
        if page == 0 {
            return Err(CoreError::validation("page numbers start at 1"));
        }
        Ok(Self {
            offset: (page - 1).saturating_mul(limit),
            limit,
        })
    }

    /// Caps the limit, rejecting a zero limit.
    pub fn clamped(self, max_limit: usize) -> CoreResult<Self> {
        if self.limit == 0 {
            return Err(CoreError::validation("limit must be positive"));
        }
        Ok(Self {
            offset: self.offset,
            limit: self.limit.min(max_limit),
        })
    }
}

/// Filter plus window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Row predicate.
    pub filter: RecordFilter,
    /// Result window.
    pub pagination: Pagination,
}

impl RecordQuery {
    /// Query with a filter and the default window.
    pub fn filtered(filter: RecordFilter) -> Self {
        Self {
            filter,
            pagination: Pagination::default(),
        }
    }

    /// Replaces the window.
    #[must_use]
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Applies the query to rows already in stable order.
    pub fn run(&self, rows: Vec<Record>) -> QueryResult {
        let matching: Vec<Record> = rows
            .into_iter()
            .filter(|r| self.filter.matches(r))
            .collect();
        let total = matching.len();
        let data = matching
            .into_iter()
            .skip(self.pagination.offset)
            .take(self.pagination.limit)
            .collect();
        QueryResult { data, total }
    }
}

/// A page of records plus the filtered total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    /// Rows in the requested window.
    pub data: Vec<Record>,
    /// Rows matching the filter, ignoring the window.
    pub total: usize,
}
