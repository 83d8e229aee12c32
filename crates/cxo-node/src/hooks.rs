//! Notification hooks.
//!
//! Hooks run inline on the actor that raises them; they must return quickly
//! and must not call back into the node and wait for the answer.

use cxo_core::Root;

use crate::connection::Connection;
use crate::error::NodeError;

/// Callbacks raised by the replication engine. Every method defaults to a
/// no-op.
pub trait Hooks: Send + Sync + 'static {
    /// A valid Root was received from a peer, before any fill decision.
    fn on_root_received(&self, _conn: &Connection, _root: &Root) {}

    /// Every object of the Root is now local.
    fn on_root_filled(&self, _root: &Root) {}

    /// A fill was abandoned.
    fn on_filling_breaks(&self, _root: &Root, _err: &NodeError) {}

    fn on_connect(&self, _conn: &Connection) {}

    fn on_disconnect(&self, _conn: &Connection) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
