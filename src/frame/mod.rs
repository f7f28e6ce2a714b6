pub mod coe;
pub mod ethercat;
#[allow(clippy::module_inception)]
mod frame;

pub use ethercat::*;
pub use frame::*;
