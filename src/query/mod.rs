pub mod index_query;
pub mod query_engine;
