#[macro_use]
extern crate serde_derive;

pub mod bootstrap;
pub mod driver;
pub mod health;
pub mod processor;
pub mod remote;
pub mod server;
pub mod sink;
