//! Reassembly of fragmented peer messages.
//!
//! The peer transport carries large payloads as a sequence of size limited fragments. This
//! module accumulates fragments keyed by `(origin node, fragment ID)` and releases the whole
//! payload to the caller once the terminal fragment arrives. Partial buffers belonging to a
//! failed node are dropped so that a multi-fragment message from a dead peer is never
//! delivered partially.

use std::collections::HashMap;

use anyhow::{bail, Result};
use bytes::{BufMut, BytesMut};

use crate::NodeId;

/// The maximum number of bytes a single reassembled message may occupy.
pub const MAX_ASSEMBLED_LEN: usize = 8 * 1024 * 1024;

/// An accumulator of message fragments, keyed by origin node and fragment ID.
///
/// At most one buffer exists per key at a time. A first fragment for an occupied key, or a
/// continuation fragment for a vacant key, is a protocol violation and fails loudly.
#[derive(Default)]
pub struct FragmentReassembler {
    buffers: HashMap<(NodeId, u64), BytesMut>,
}

impl FragmentReassembler {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a received fragment, returning the assembled payload once the terminal
    /// fragment for its key has arrived.
    pub fn on_fragment(&mut self, sender: NodeId, fragment_id: u64, first: bool, last: bool, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = (sender, fragment_id);
        if first {
            if self.buffers.contains_key(&key) {
                bail!("protocol violation: duplicate first fragment {} from node {}", fragment_id, sender);
            }
            self.buffers.insert(key, BytesMut::with_capacity(data.len()));
        }
        let buf = match self.buffers.get_mut(&key) {
            Some(buf) => buf,
            None => bail!("protocol violation: continuation of unknown fragment {} from node {}", fragment_id, sender),
        };
        if buf.len().saturating_add(data.len()) > MAX_ASSEMBLED_LEN {
            self.buffers.remove(&key);
            bail!("message from node {} exceeds the maximum assembled length of {} bytes", sender, MAX_ASSEMBLED_LEN);
        }
        buf.put_slice(data);
        if !last {
            return Ok(None);
        }
        Ok(self.buffers.remove(&key).map(|buf| buf.to_vec()))
    }

    /// Drop all partial buffers belonging to the given failed node.
    pub fn on_node_failed(&mut self, sender: NodeId) {
        self.buffers.retain(|(origin, _), _| *origin != sender);
    }

    /// The number of partial buffers currently held.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}
