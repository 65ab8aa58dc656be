pub mod locator;
pub mod parse;
pub mod proxy;
pub mod runner;
