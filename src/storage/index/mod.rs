pub mod branch_indexer;
pub mod indexer;
pub mod persistent_tree;
pub mod storage_leaf;
