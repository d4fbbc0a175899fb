// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod redis;
pub mod scenario;
pub mod utils;

pub use utils::*;
