//! Platform-specific bits isolated from the rest of the daemon's logic, the
//! way `backend/session`'s per-backend modules keep ioctl/libc plumbing out
//! of the handler-facing code in the reference tree.

pub mod process;
pub mod vt;
