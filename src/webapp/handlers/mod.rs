pub mod callers;
pub mod connections;
pub mod health;
pub mod proxy;
pub mod resources;
pub mod tools;
