pub mod address;
pub mod range;

pub use address::{Address, NetworkPrefix};
pub use range::AddressRange;
