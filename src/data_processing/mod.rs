mod batcher;
mod dataset;
pub(crate) mod tokenizer;

pub use batcher::*;
pub use dataset::*;
pub use tokenizer::*;
