pub mod dsl;
pub mod engine;

pub use dsl::{Pagination, SearchFilters, SearchFlags, SearchRequest, SearchWeights};
pub use engine::{SearchEngine, SearchError, SearchResponse, SearchResultItem};
