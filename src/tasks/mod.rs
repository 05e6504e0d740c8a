pub mod cursor;
pub mod finalizer;
pub mod rate_limiter;
pub mod scheduler;
pub mod sender;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
