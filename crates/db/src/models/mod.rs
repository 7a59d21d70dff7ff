pub mod acceptance_criterion;
pub mod audit_event;
pub mod cycle;
pub mod learning;
pub mod permission_rule;
pub mod project;
pub mod repo;
pub mod session_branch;
pub mod task;
