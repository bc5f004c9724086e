//! Vector search.

mod vector;

pub use vector::{VectorIndex, VectorIndexStats};
