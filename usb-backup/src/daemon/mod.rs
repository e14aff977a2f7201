//! Process lifecycle support for the daemon.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
