mod augmenter;
mod classifier;
mod decoder;
mod encoder;
mod generation;
mod position;

pub use augmenter::*;
pub use classifier::*;
pub use decoder::*;
pub use encoder::*;
pub use generation::*;
pub use position::*;
