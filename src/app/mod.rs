pub mod adb;
pub mod bugreport;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod logcat;
pub mod logging;
pub mod logline;
pub mod paths;
pub mod ports;
pub mod rpc;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
