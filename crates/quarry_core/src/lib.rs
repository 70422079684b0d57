pub mod catalog;
pub mod config;
pub mod scheduling;
pub mod storage;
pub mod util;
