pub mod model;
pub mod scheduler;
pub mod service;

#[cfg(test)]
pub mod testing;

pub use scheduler::Scheduler;
pub use service::JobService;
