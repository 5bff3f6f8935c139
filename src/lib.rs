pub mod annas;
pub mod app;
pub mod backend;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod normalize;
pub mod output;
pub mod selector;
pub mod session;
pub mod store;
pub mod zlib;
