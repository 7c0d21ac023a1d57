//! Fixed-capacity arena of virtual connections.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::net::{BoxIo, ConnectionId};
use crate::vc::side::{ReadSide, VcIo, WriteSide};
use crate::vc::{IoId, VcHandle, VcHandler, VcKind};

/// Handle table errors. All of them indicate an engine bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VcTableError {
    #[error("handle table full ({capacity} slots)")]
    Full { capacity: usize },

    #[error("stale handle {0}")]
    Stale(VcHandle),

    #[error("slot {0} is not reserved for binding")]
    NotReserved(VcHandle),

    #[error("{0} is owned by a tunnel")]
    InTunnel(VcHandle),

    #[error("{handle} has no {side} side")]
    MissingSide { handle: VcHandle, side: &'static str },
}

/// One bound connection.
pub struct VcEntry {
    identity: ConnectionId,
    kind: VcKind,
    io: IoId,
    read: Option<ReadSide>,
    write: Option<WriteSide>,
    handler: VcHandler,
    end_of_stream: bool,
    in_tunnel: bool,
    cancel: CancellationToken,
}

impl VcEntry {
    pub fn identity(&self) -> ConnectionId {
        self.identity
    }

    pub fn kind(&self) -> VcKind {
        self.kind
    }

    pub fn io_id(&self) -> IoId {
        self.io
    }

    pub fn handler(&self) -> VcHandler {
        self.handler
    }

    pub fn set_handler(&mut self, handler: VcHandler) {
        self.handler = handler;
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn set_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    pub fn in_tunnel(&self) -> bool {
        self.in_tunnel
    }

    /// Cancelled when the entry is retired; pending reads and writes select on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reader_mut(&mut self) -> Option<&mut ReadSide> {
        self.read.as_mut()
    }

    pub fn writer_mut(&mut self) -> Option<&mut WriteSide> {
        self.write.as_mut()
    }

    pub fn has_read_side(&self) -> bool {
        self.read.is_some()
    }

    pub fn has_write_side(&self) -> bool {
        self.write.is_some()
    }

    /// Reassemble the network stream when both halves are present.
    pub fn into_stream(self) -> Option<BoxIo> {
        match (self.read, self.write) {
            (Some(ReadSide::Net(r)), Some(WriteSide::Net(w))) => Some(r.unsplit(w)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for VcEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcEntry")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("io", &self.io)
            .field("handler", &self.handler)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("end_of_stream", &self.end_of_stream)
            .field("in_tunnel", &self.in_tunnel)
            .finish()
    }
}

enum SlotState {
    Empty,
    Reserved,
    Bound(VcEntry),
}

struct Slot {
    generation: u32,
    state: SlotState,
}

/// Registry of every connection one transaction touches.
pub struct VcTable {
    slots: Vec<Slot>,
}

impl VcTable {
    /// One slot per connection role.
    pub const DEFAULT_CAPACITY: usize = VcKind::ALL.len();

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: SlotState::Empty,
            })
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserved plus bound slots.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SlotState::Empty))
            .count()
    }

    /// Reserve an empty slot.
    pub fn allocate(&mut self) -> Result<VcHandle, VcTableError> {
        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| matches!(s.state, SlotState::Empty))
            .ok_or(VcTableError::Full { capacity })?;

        slot.state = SlotState::Reserved;
        // Capacity is tiny; the index always fits.
        Ok(VcHandle::new(index as u16, slot.generation))
    }

    /// Attach a connection to a reserved slot.
    pub fn bind(
        &mut self,
        handle: VcHandle,
        identity: ConnectionId,
        kind: VcKind,
        io: VcIo,
    ) -> Result<IoId, VcTableError> {
        let slot = self.slot_mut(handle)?;
        if !matches!(slot.state, SlotState::Reserved) {
            return Err(VcTableError::NotReserved(handle));
        }

        let (read, write) = match io {
            VcIo::Stream(stream) => {
                let (r, w) = tokio::io::split(stream);
                (Some(ReadSide::Net(r)), Some(WriteSide::Net(w)))
            }
            VcIo::Source(r) => (Some(ReadSide::Source(r)), None),
            VcIo::Sink(w) => (None, Some(WriteSide::Sink(w))),
        };
        let io = IoId::next();

        slot.state = SlotState::Bound(VcEntry {
            identity,
            kind,
            io,
            read,
            write,
            handler: VcHandler::Idle,
            end_of_stream: false,
            in_tunnel: false,
            cancel: CancellationToken::new(),
        });

        tracing::trace!(vc = %handle, %identity, %kind, %io, "VC bound");
        Ok(io)
    }

    /// `allocate` followed by `bind`.
    pub fn attach(
        &mut self,
        identity: ConnectionId,
        kind: VcKind,
        io: VcIo,
    ) -> Result<VcHandle, VcTableError> {
        let handle = self.allocate()?;
        if let Err(e) = self.bind(handle, identity, kind, io) {
            self.free(handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn find_by_identity(&self, identity: ConnectionId) -> Option<VcHandle> {
        self.find(|e| e.identity == identity)
    }

    pub fn find_by_io_handle(&self, io: IoId) -> Option<VcHandle> {
        self.find(|e| e.io == io)
    }

    pub fn find_by_kind(&self, kind: VcKind) -> Option<VcHandle> {
        self.find(|e| e.kind == kind)
    }

    pub fn get(&self, handle: VcHandle) -> Result<&VcEntry, VcTableError> {
        match self.slot(handle)?.state {
            SlotState::Bound(ref entry) => Ok(entry),
            _ => Err(VcTableError::Stale(handle)),
        }
    }

    pub fn get_mut(&mut self, handle: VcHandle) -> Result<&mut VcEntry, VcTableError> {
        match self.slot_mut(handle)?.state {
            SlotState::Bound(ref mut entry) => Ok(entry),
            _ => Err(VcTableError::Stale(handle)),
        }
    }

    /// Clear the slot without closing; the caller now owns the I/O.
    /// Releasing a reserved slot returns `None`.
    pub fn release(&mut self, handle: VcHandle) -> Result<Option<VcEntry>, VcTableError> {
        let slot = self.slot_mut(handle)?;
        if let SlotState::Bound(ref entry) = slot.state {
            if entry.in_tunnel {
                return Err(VcTableError::InTunnel(handle));
            }
        }
        Ok(self.free(handle))
    }

    /// Close the connection and clear the slot.
    pub fn retire(&mut self, handle: VcHandle) -> Result<(), VcTableError> {
        let slot = self.slot_mut(handle)?;
        if let SlotState::Bound(ref entry) = slot.state {
            if entry.in_tunnel {
                return Err(VcTableError::InTunnel(handle));
            }
        }
        self.close(handle);
        Ok(())
    }

    /// Retire every slot not owned by a tunnel. Safe to call repeatedly.
    /// Returns how many connections were closed.
    pub fn retire_all(&mut self) -> usize {
        let mut closed = 0;
        for index in 0..self.slots.len() {
            let handle = VcHandle::new(index as u16, self.slots[index].generation);
            let bound = match &self.slots[index].state {
                SlotState::Empty => continue,
                SlotState::Reserved => false,
                SlotState::Bound(entry) if entry.in_tunnel => {
                    tracing::error!(vc = %handle, kind = %entry.kind, "VC still owned by a tunnel at teardown");
                    continue;
                }
                SlotState::Bound(_) => true,
            };
            if bound {
                self.close(handle);
                closed += 1;
            } else {
                self.free(handle);
            }
        }
        closed
    }

    /// Take the read side out while the engine reads a message head from it,
    /// so another entry can be read at the same time.
    pub(crate) fn lend_read(&mut self, handle: VcHandle, handler: VcHandler) -> Result<ReadSide, VcTableError> {
        let entry = self.get_mut(handle)?;
        let side = entry.read.take().ok_or(VcTableError::MissingSide {
            handle,
            side: "read",
        })?;
        entry.handler = handler;
        Ok(side)
    }

    pub(crate) fn restore_read(&mut self, handle: VcHandle, side: ReadSide) -> Result<(), VcTableError> {
        let entry = self.get_mut(handle)?;
        entry.read = Some(side);
        entry.handler = VcHandler::Idle;
        Ok(())
    }

    // Tunnel side. The tunnel is the only owner allowed to close in-tunnel entries.

    pub(crate) fn take_read_for_tunnel(&mut self, handle: VcHandle) -> Result<ReadSide, VcTableError> {
        let entry = self.get_mut(handle)?;
        let side = entry.read.take().ok_or(VcTableError::MissingSide {
            handle,
            side: "read",
        })?;
        entry.in_tunnel = true;
        entry.handler = VcHandler::Tunnel;
        Ok(side)
    }

    pub(crate) fn take_write_for_tunnel(&mut self, handle: VcHandle) -> Result<WriteSide, VcTableError> {
        let entry = self.get_mut(handle)?;
        let side = entry.write.take().ok_or(VcTableError::MissingSide {
            handle,
            side: "write",
        })?;
        entry.in_tunnel = true;
        entry.handler = VcHandler::Tunnel;
        Ok(side)
    }

    pub(crate) fn return_read(&mut self, handle: VcHandle, side: ReadSide) -> Result<(), VcTableError> {
        self.get_mut(handle)?.read = Some(side);
        Ok(())
    }

    pub(crate) fn return_write(&mut self, handle: VcHandle, side: WriteSide) -> Result<(), VcTableError> {
        self.get_mut(handle)?.write = Some(side);
        Ok(())
    }

    pub(crate) fn mark_end_of_stream(&mut self, handle: VcHandle) -> Result<(), VcTableError> {
        self.get_mut(handle)?.end_of_stream = true;
        Ok(())
    }

    /// Hand the entry back from the tunnel. An entry left with no sides was
    /// fully closed by the tunnel and its slot is freed.
    pub(crate) fn leave_tunnel(&mut self, handle: VcHandle) -> Result<(), VcTableError> {
        let entry = self.get_mut(handle)?;
        entry.in_tunnel = false;
        entry.handler = VcHandler::Idle;
        if entry.read.is_none() && entry.write.is_none() {
            self.close(handle);
        }
        Ok(())
    }

    /// Close an entry regardless of tunnel membership.
    pub(crate) fn tunnel_retire(&mut self, handle: VcHandle) -> Result<(), VcTableError> {
        self.slot(handle)?;
        self.close(handle);
        Ok(())
    }

    fn find(&self, pred: impl Fn(&VcEntry) -> bool) -> Option<VcHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match slot.state {
            SlotState::Bound(ref entry) if pred(entry) => {
                Some(VcHandle::new(index as u16, slot.generation))
            }
            _ => None,
        })
    }

    fn slot(&self, handle: VcHandle) -> Result<&Slot, VcTableError> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.generation == handle.generation() => Ok(slot),
            _ => Err(VcTableError::Stale(handle)),
        }
    }

    fn slot_mut(&mut self, handle: VcHandle) -> Result<&mut Slot, VcTableError> {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.generation == handle.generation() => Ok(slot),
            _ => Err(VcTableError::Stale(handle)),
        }
    }

    fn free(&mut self, handle: VcHandle) -> Option<VcEntry> {
        let slot = &mut self.slots[handle.index()];
        slot.generation = slot.generation.wrapping_add(1);
        match std::mem::replace(&mut slot.state, SlotState::Empty) {
            SlotState::Bound(entry) => Some(entry),
            _ => None,
        }
    }

    fn close(&mut self, handle: VcHandle) {
        if let Some(entry) = self.free(handle) {
            entry.cancel.cancel();
            tracing::trace!(vc = %handle, identity = %entry.identity, kind = %entry.kind, "VC retired");
        }
    }
}

impl Default for VcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::io::boxed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stream() -> (VcIo, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        (VcIo::Stream(boxed(ours)), theirs)
    }

    #[test]
    fn allocation_fails_past_capacity() {
        let mut table = VcTable::new();
        for _ in 0..VcTable::DEFAULT_CAPACITY {
            table.allocate().unwrap();
        }
        assert_eq!(
            table.allocate(),
            Err(VcTableError::Full {
                capacity: VcTable::DEFAULT_CAPACITY
            })
        );
        assert_eq!(table.live_count(), VcTable::DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn stale_handles_are_detected() {
        let mut table = VcTable::new();
        let (io, _peer) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::Client, io).unwrap();
        table.retire(h).unwrap();

        assert_eq!(table.get(h).unwrap_err(), VcTableError::Stale(h));
        assert_eq!(table.retire(h), Err(VcTableError::Stale(h)));

        let (io, _peer) = stream();
        let h2 = table.attach(ConnectionId::new(), VcKind::Origin, io).unwrap();
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2, h);
        assert!(table.get(h).is_err());
    }

    #[test]
    fn bind_requires_reservation() {
        let mut table = VcTable::new();
        let h = table.allocate().unwrap();
        let (io, _peer) = stream();
        table.bind(h, ConnectionId::new(), VcKind::Client, io).unwrap();

        let (io, _peer) = stream();
        assert_eq!(
            table.bind(h, ConnectionId::new(), VcKind::Client, io),
            Err(VcTableError::NotReserved(h))
        );
    }

    #[tokio::test]
    async fn lookups_by_identity_io_and_kind() {
        let mut table = VcTable::new();
        let id = ConnectionId::new();
        let (io, _peer) = stream();
        let h = table.attach(id, VcKind::Origin, io).unwrap();
        let io_id = table.get(h).unwrap().io_id();

        assert_eq!(table.find_by_identity(id), Some(h));
        assert_eq!(table.find_by_io_handle(io_id), Some(h));
        assert_eq!(table.find_by_kind(VcKind::Origin), Some(h));
        assert_eq!(table.find_by_kind(VcKind::Client), None);

        table.retire(h).unwrap();
        assert_eq!(table.find_by_io_handle(io_id), None);
    }

    #[tokio::test]
    async fn release_keeps_connection_open() {
        let mut table = VcTable::new();
        let (io, mut peer) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::Origin, io).unwrap();

        let entry = table.release(h).unwrap().unwrap();
        let mut stream = entry.into_stream().unwrap();
        stream.write_all(b"still here").await.unwrap();

        let mut buf = [0u8; 10];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
        assert_eq!(table.live_count(), 0);
    }

    #[tokio::test]
    async fn retire_closes_and_cancels() {
        let mut table = VcTable::new();
        let (io, mut peer) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::Client, io).unwrap();
        let token = table.get(h).unwrap().cancel_token();

        table.retire(h).unwrap();
        assert!(token.is_cancelled());

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tunnel_owned_entries_refuse_direct_close() {
        let mut table = VcTable::new();
        let (io, _peer) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::Origin, io).unwrap();
        let side = table.take_read_for_tunnel(h).unwrap();

        assert_eq!(table.retire(h), Err(VcTableError::InTunnel(h)));
        assert_eq!(table.release(h).unwrap_err(), VcTableError::InTunnel(h));
        assert_eq!(table.retire_all(), 0);
        assert_eq!(table.live_count(), 1);

        table.return_read(h, side).unwrap();
        table.leave_tunnel(h).unwrap();
        table.retire(h).unwrap();
    }

    #[tokio::test]
    async fn leaving_tunnel_without_sides_frees_slot() {
        let mut table = VcTable::new();
        let (io, _peer) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::RawServer, io).unwrap();
        drop(table.take_read_for_tunnel(h).unwrap());
        drop(table.take_write_for_tunnel(h).unwrap());

        table.leave_tunnel(h).unwrap();
        assert_eq!(table.live_count(), 0);
    }

    #[tokio::test]
    async fn lent_read_side_comes_back() {
        let mut table = VcTable::new();
        let (io, mut peer) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::Origin, io).unwrap();

        let mut side = table.lend_read(h, VcHandler::OriginResponseHeader).unwrap();
        assert_eq!(table.get(h).unwrap().handler(), VcHandler::OriginResponseHeader);
        assert!(!table.get(h).unwrap().has_read_side());
        assert!(!table.get(h).unwrap().in_tunnel());

        peer.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        side.read_exact(&mut buf).await.unwrap();
        table.restore_read(h, side).unwrap();
        assert!(table.get(h).unwrap().has_read_side());
        assert_eq!(table.get(h).unwrap().handler(), VcHandler::Idle);
    }

    #[tokio::test]
    async fn retire_all_is_idempotent() {
        let mut table = VcTable::new();
        let (io, _p1) = stream();
        table.attach(ConnectionId::new(), VcKind::Client, io).unwrap();
        let (io, _p2) = stream();
        let h = table.attach(ConnectionId::new(), VcKind::Origin, io).unwrap();
        table.allocate().unwrap();
        table.retire(h).unwrap();

        assert_eq!(table.retire_all(), 1);
        assert_eq!(table.retire_all(), 0);
        assert_eq!(table.live_count(), 0);
    }
}
