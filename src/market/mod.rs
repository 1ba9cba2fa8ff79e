pub mod backoff;
pub mod binance;
pub mod board;
pub mod cache;
pub mod controller;
pub mod persistence;
pub mod poll;
pub mod series;
pub mod spot;
pub mod stream;
pub mod throttle;
pub mod types;
