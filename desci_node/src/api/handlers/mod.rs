pub mod datasets;
pub mod health;
pub mod metrics;
pub mod research;
