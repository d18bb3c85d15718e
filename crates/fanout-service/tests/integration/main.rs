// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod aggregation;
pub mod coalescing;
pub mod utils;

pub use utils::*;
