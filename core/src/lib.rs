pub mod allocator;
pub mod availability;
pub mod clock;
pub mod config;
pub mod demand;
pub mod engine;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod popularity;
pub mod reconciliation_subsystem;
pub mod rental_subsystem;
pub mod rng;
pub mod store;
pub mod subsystem;
pub mod types;
