pub mod budget;
pub mod checkpoint;
pub mod salience;

pub use budget::*;
pub use checkpoint::*;
pub use salience::*;
