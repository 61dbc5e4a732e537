pub mod callbacks;
pub mod config;
pub mod crawler;
pub mod db;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod registration;
pub mod registry;
pub mod worker;

#[cfg(test)]
mod test_support;
