//! Built-in handler sets registered by the binary.
//!
//! Domain handler packs follow the same shape: build a [`Router`] with their
//! routes and hand it to the root before arming.
pub mod health;
pub mod node_proxy;
pub mod system_info;

use crate::core::router::{RouterError, RouterRoot};

/// Register every built-in handler set.
pub fn register_all(root: &RouterRoot) -> Result<(), RouterError> {
    root.add_router(health::router())?;
    root.add_router(system_info::router())?;
    root.add_router(node_proxy::router())?;
    Ok(())
}
