//! Sort and pagination inputs for local queries.

/// Rows returned per page when the caller does not say otherwise.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySortDescriptor {
    /// Field to sort by.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

impl QuerySortDescriptor {
    /// Ascending sort on `field`.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    /// Descending sort on `field`.
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }
}

/// Page selection for a local query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPaginationInput {
    /// Zero-based page index.
    pub page: usize,
    /// Rows per page.
    pub limit: usize,
}

impl QueryPaginationInput {
    /// Page `page` of `limit` rows.
    pub fn page(page: usize, limit: usize) -> Self {
        Self { page, limit }
    }

    /// The first row only.
    pub fn first_result() -> Self {
        Self { page: 0, limit: 1 }
    }

    /// Offset of the first row on this page.
    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.limit)
    }
}

impl Default for QueryPaginationInput {
    fn default() -> Self {
        Self {
            page: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}
