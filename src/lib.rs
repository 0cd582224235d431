pub mod config;
pub mod container;
pub mod duck;
pub mod extract;
pub mod geocode;
pub mod history;
pub mod linker;
pub mod location;
pub mod logging;
pub mod mapper;
pub mod package;
pub mod pipeline;
pub mod table;
pub mod warehouse;
