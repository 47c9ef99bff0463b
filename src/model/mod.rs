//! Wire and domain data: order commands, notifications and shopping baskets.

pub mod basket;
pub mod order;

pub use basket::*;
pub use order::*;
