mod analysis;
mod export;
mod tracker;

pub use analysis::*;
pub use export::*;
pub use tracker::*;
