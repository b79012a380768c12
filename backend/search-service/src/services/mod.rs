pub mod merge;
pub mod quota;
pub mod ranking;
pub mod retrievers;
pub mod search;
pub mod suggestions;
pub mod text_query;
pub mod trending;
