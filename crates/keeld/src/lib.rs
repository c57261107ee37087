//! keeld — the Keel scheduler daemon.
//!
//! The binary is a thin CLI over [`control_plane::ControlPlane`], which
//! wires every subsystem together. Standalone mode runs a single replica
//! against the in-process [`loopback::LoopbackResourceManager`].

pub mod control_plane;
pub mod loopback;

pub use control_plane::ControlPlane;
pub use loopback::LoopbackResourceManager;
