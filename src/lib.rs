pub mod barrier;
pub mod bell;
pub mod context;
pub mod control;
pub mod current;
pub mod device;
pub mod error;
pub mod group;
pub mod kernel;
pub mod metrics;
pub mod named_barrier;
pub mod occupancy;
pub mod platform;
pub mod scheduler;
pub mod slm;
pub mod work_item;

pub use context::ItemCtx;
pub use device::Device;
pub use error::{Result, SimError};
pub use kernel::{Axis, Dim3, Kernel, LaunchConfig};
pub use named_barrier::NamedBarrierRole;
pub use platform::PlatformConfig;
pub use scheduler::{LaunchHandle, LaunchMode, LaunchStats};
