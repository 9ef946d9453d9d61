#[macro_use]
extern crate log;

pub mod command;
pub mod error;
pub mod registry;
pub mod routes;
pub mod service;
pub mod settings;
