pub mod describe;
pub mod descriptor;
pub mod error;
pub mod group;
pub mod retry;
pub mod status;
pub mod store;
pub mod task;
pub mod worker;

#[cfg(test)]
pub mod testkit;
