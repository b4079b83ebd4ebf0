pub mod executions;
pub mod forward;
pub mod payload;
pub mod response;

#[cfg(test)]
mod integration_tests;
