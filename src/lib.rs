pub mod api;
pub mod automation;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod playbook;
pub mod resolver;
pub mod retailers;
pub mod scheduler;
pub mod types;
