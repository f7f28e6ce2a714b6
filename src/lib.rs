#![cfg_attr(not(test), no_std)]

pub mod al_status_code;
pub mod bus;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod link;
pub mod mailbox;
pub mod port;
pub mod register;
pub mod sii;
pub mod slave;
pub mod time;

pub use bus::*;
pub use error::*;
pub use time::*;
