mod runner;
mod state;
mod steps;

pub use runner::*;
pub use state::*;
pub use steps::*;
