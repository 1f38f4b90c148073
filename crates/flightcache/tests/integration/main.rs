// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod future_cache;
pub mod sync_cache;
