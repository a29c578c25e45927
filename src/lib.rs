pub mod cli;
pub mod crawler;
pub mod network;
pub mod storage;
pub mod utils;
