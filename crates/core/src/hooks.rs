//! Module hook boundary.
//!
//! External modules transform or drop packets at exactly two points:
//! before a packet enters the batching buffer, and after link delivery
//! before chunk-cache processing. Hooks are invoked from the owning
//! direction's dispatch task, so for any one connection they always see
//! packets in arrival order and are never called concurrently.

use crate::packet::Packet;

/// Outcome of a hook invocation.
#[derive(Debug)]
pub enum HookVerdict {
    /// Keep going with this (possibly rewritten) packet.
    Forward(Packet),
    /// Swallow the packet; it never reaches the next stage.
    Drop,
}

/// One packet-transform extension point.
///
/// Both methods default to pass-through so a module only implements the
/// point it cares about. Hooks may hold per-connection state; the core
/// guarantees serialized invocation per connection.
pub trait PacketHook: Send {
    /// Called per packet before it enters the batching buffer.
    fn pre_batch(&mut self, packet: Packet) -> HookVerdict {
        HookVerdict::Forward(packet)
    }

    /// Called per packet after link delivery, before chunk-cache processing.
    fn post_decompress(&mut self, packet: Packet) -> HookVerdict {
        HookVerdict::Forward(packet)
    }
}

/// Ordered collection of registered hooks.
///
/// Hooks run in registration order; the first `Drop` verdict wins.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn PacketHook>>,
}

impl HookChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; it runs after all previously registered hooks.
    pub fn register(&mut self, hook: Box<dyn PacketHook>) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true when no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the pre-batch point over every hook.
    pub fn pre_batch(&mut self, packet: Packet) -> Option<Packet> {
        let mut current = packet;
        for hook in &mut self.hooks {
            match hook.pre_batch(current) {
                HookVerdict::Forward(packet) => current = packet,
                HookVerdict::Drop => return None,
            }
        }
        Some(current)
    }

    /// Run the post-decompress point over every hook.
    pub fn post_decompress(&mut self, packet: Packet) -> Option<Packet> {
        let mut current = packet;
        for hook in &mut self.hooks {
            match hook.post_decompress(current) {
                HookVerdict::Forward(packet) => current = packet,
                HookVerdict::Drop => return None,
            }
        }
        Some(current)
    }
}
