pub mod api;
pub mod common;
pub mod downloader;
pub mod parser;
pub mod persist;
pub mod post_process;
