pub mod cache;
pub mod calendar;
pub mod collector;
pub mod consolidate;
pub mod http;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod sources;
