//! The build-time plugin table.
//!
//! Native code cannot be hot-loaded, so every plugin that may ever run on
//! this platform is compiled in and listed here. Boot enables the locals;
//! dynamic install enables table entries at runtime via the coordination
//! hooks.

use std::sync::Arc;

use plinth_core::BackendPlugin;

/// All backend plugins compiled into this build, in registration order.
pub fn plugin_table() -> Vec<Arc<dyn BackendPlugin>> {
    // Domain plugins register here:
    //   vec![Arc::new(catalog::CatalogPlugin), Arc::new(webhooks::WebhooksPlugin)]
    Vec::new()
}
