mod services;
mod shutdown;

pub use services::Services;
pub use shutdown::ShutdownGuard;
