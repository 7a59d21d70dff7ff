pub mod approvals;
pub mod command;
pub mod events;
pub mod executors;
