pub mod budget;
pub mod controller;
pub mod metrics;
pub mod proxy;
