// Use mimalloc only on x86_64 to avoid cross-compilation issues
#[cfg(all(feature = "mimalloc", target_arch = "x86_64"))]
use mimalloc::MiMalloc;

#[cfg(all(feature = "mimalloc", target_arch = "x86_64"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod health;
pub mod job;
pub mod logs;
pub mod notify;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod util;
