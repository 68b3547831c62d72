//! In-memory side of the data plane: the arrival-ordered record chain, its analyzer, the
//! weakly-owning index tree and the evictor that keeps both within budget.

pub mod analyzer;
pub mod atomic_buffer;
pub mod buffer_element;
pub mod evictor;
pub mod index_leaf;
pub mod index_tree;
