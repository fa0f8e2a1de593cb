pub mod actor;
pub mod apply;
pub mod cluster;
pub mod condition;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod image_reference;
pub mod resources;
pub mod state;
pub mod webserver;
pub mod workload;
