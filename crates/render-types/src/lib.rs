mod entities;
mod error;
mod ids;
mod steps;

pub use entities::*;
pub use error::*;
pub use ids::*;
pub use steps::*;
