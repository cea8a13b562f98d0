pub mod instrument;
pub mod price;
pub mod size;
pub mod symbol;

pub use instrument::{Instrument, Position, PositionSide};
pub use price::Price;
pub use size::Size;
pub use symbol::Symbol;
