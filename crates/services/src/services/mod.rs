pub mod acceptance;
pub mod audit;
pub mod branches;
pub mod config;
pub mod context_digest;
pub mod cycles;
pub mod git;
pub mod permissions;
pub mod recovery;
pub mod tasks;
pub mod worktree_manager;
