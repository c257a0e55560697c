//! Event handling system for hub status updates.
//!
//! This module provides the event infrastructure for notifying about
//! hub state changes such as connection status, script lifecycle, and
//! streamed script output.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

/// Events that can be emitted by the hub service.
#[derive(Debug, Clone)]
pub enum HubEvent {
   HubConnected,
   HubDisconnected,
   ScriptStarted,
   ScriptFinished { ok: bool },
   /// One line printed by the running script, without the trailing newline.
   ScriptOutput(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, address: Address, event: HubEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
