//! Page arithmetic for search results
//!
//! Pages are 1-indexed; out-of-range requests clamp to the nearest page.

/// Works per search page
pub const PAGE_SIZE: i64 = 20;

/// Resolved page position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub total_pages: i64,
    pub offset: i64,
}

/// Clamp `requested_page` into `1..=total_pages` for `total_results` works
///
/// ```
/// use tagrank_api::pagination::calculate_pagination;
///
/// let p = calculate_pagination(45, 9);
/// assert_eq!(p.page, 3);
/// assert_eq!(p.offset, 40);
/// ```
pub fn calculate_pagination(total_results: i64, requested_page: i64) -> Pagination {
    let total_pages = (total_results + PAGE_SIZE - 1) / PAGE_SIZE;
    let page = requested_page.max(1).min(total_pages.max(1));

    Pagination {
        page,
        total_pages,
        offset: (page - 1) * PAGE_SIZE,
    }
}

/// Offset of a requested page before the total is known
pub fn requested_offset(requested_page: i64) -> i64 {
    (requested_page.max(1) - 1) * PAGE_SIZE
}
