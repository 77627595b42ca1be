//! Phase 2: pointer chain search
//!
//! Walks backwards from the search address over the pointer index built in
//! phase 1, one level per additional offset.
//!
//! ## Algorithm
//! - Layer BFS: lazy, level-by-level expansion with per-branch cycle detection

pub mod layer_bfs;

pub use layer_bfs::{search, ChainSearch, MAX_CANDIDATES_PER_LAYER};
