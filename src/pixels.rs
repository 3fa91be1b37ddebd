pub mod converter;
pub mod lookup;

pub use converter::{PixelConverter, SENTINEL};
pub use lookup::{LookupError, LookupTable};
