pub mod broker;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod game;
pub mod handlers;
pub mod models;
pub mod pixels;
pub mod script_loader;
