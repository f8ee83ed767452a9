pub mod audit_loop;
pub mod pipeline;
pub mod watcher;
