pub mod configuration;
pub mod coordinator;
pub mod errors;
pub mod esi_client;
pub mod market_cache;
pub mod pagination;
pub mod reqwest_helpers;
pub mod topology;
pub mod worker_pool;

#[cfg(test)]
pub mod test_support;
