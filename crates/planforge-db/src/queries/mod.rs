pub mod metrics;
pub mod profiles;
pub mod requests;
