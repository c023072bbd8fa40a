pub mod aggregator;
pub mod bitmex;
pub mod controller;
pub mod pipeline;
pub mod series;
pub mod types;
