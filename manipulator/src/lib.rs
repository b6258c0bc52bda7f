pub mod command_executor;
pub mod commands;
pub mod communication;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod pause;
pub mod speed;
