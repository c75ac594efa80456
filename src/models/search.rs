use serde::{Deserialize, Serialize};

/// Raw per-user search log row. Strict 24 h retention; user IDs are stored
/// hashed, never raw.
#[derive(Debug, Clone)]
pub struct RecentSearchRow {
    pub id: String,
    pub user_hash: String,
    pub query: String,
    pub normalized_query: String,
    pub city: Option<String>,
    pub result_count: i64,
    pub searched_at: String,
}

/// K-anonymous daily aggregate. `unique_users` stays server-side.
#[derive(Debug, Clone)]
pub struct SearchAggregateRow {
    pub id: String,
    pub normalized_query: String,
    pub city: String,
    pub count: i64,
    pub unique_users: i64,
    pub period_start: String,
    pub period_end: String,
}

/// What `getPopularSearches` exposes: counts only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularSearch {
    pub normalized_query: String,
    pub city: String,
    pub count: i64,
    pub period_start: String,
    pub period_end: String,
}

impl From<SearchAggregateRow> for PopularSearch {
    fn from(r: SearchAggregateRow) -> Self {
        Self {
            normalized_query: r.normalized_query,
            city: r.city,
            count: r.count,
            period_start: r.period_start,
            period_end: r.period_end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSearch {
    pub query: String,
    pub city: Option<String>,
    pub result_count: i64,
    pub searched_at: String,
}

impl From<RecentSearchRow> for RecentSearch {
    fn from(r: RecentSearchRow) -> Self {
        Self {
            query: r.query,
            city: r.city,
            result_count: r.result_count,
            searched_at: r.searched_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSearchRequest {
    pub query: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub result_count: Option<i64>,
}
