//! Runtime components: ports, child processes, workers and the launch pipeline

pub mod identity;
pub mod launcher;
pub mod ports;
pub mod process;
pub mod registry;
pub mod scripts;
pub mod service;
pub mod shutdown;
pub mod worker;

pub use identity::*;
pub use launcher::*;
pub use ports::*;
pub use process::*;
pub use registry::*;
pub use scripts::*;
pub use service::*;
pub use shutdown::*;
pub use worker::*;
