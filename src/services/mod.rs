pub mod encryption;
pub mod notification;
pub mod process;

// Re-export commonly used services
pub use encryption::*;
pub use notification::*;
pub use process::*;
