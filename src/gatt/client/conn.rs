use tracing::{debug, trace, warn};

use crate::att::{self, Handle, HandleRange};
use crate::gap::{Descriptor, Uuid};
use crate::hci::{ConnHandle, Status};

use super::*;

/// Connection state. Discovery moves forward through the variants in
/// declaration order and ends in `Connected`. The index carried by the
/// descriptor and notification states selects the characteristic slot being
/// processed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum State {
    WantPrimaryService,
    AwaitPrimaryService { found: bool },
    WantCharacteristics,
    AwaitCharacteristics,
    WantDescriptors(usize),
    AwaitDescriptors(usize),
    WantNotification(usize),
    AwaitNotification(usize),
    Connected(Op),
}

impl State {
    /// Returns whether the connection finished discovery.
    #[inline]
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(*self, Self::Connected(_))
    }

    /// Returns whether the connection is waiting for a procedure to complete.
    #[inline]
    #[must_use]
    const fn is_waiting(&self) -> bool {
        matches!(
            *self,
            Self::AwaitPrimaryService { .. }
                | Self::AwaitCharacteristics
                | Self::AwaitDescriptors(_)
                | Self::AwaitNotification(_)
                | Self::Connected(Op::AwaitRead { .. } | Op::AwaitWrite(_))
        )
    }
}

/// Characteristic value operation of a connected client. At most one
/// operation is in flight per connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Op {
    #[default]
    Idle,
    WantRead(usize),
    AwaitRead {
        index: usize,
        value: Vec<u8>,
    },
    WantWrite {
        index: usize,
        value: Vec<u8>,
    },
    AwaitWrite(usize),
}

/// Action that the engine must take after a connection state change.
#[derive(Debug, Eq, PartialEq)]
#[must_use]
pub(super) enum Next {
    /// Nothing to do until the next event.
    Wait,
    /// Request permission to send the next procedure.
    Request,
    /// Discovery finished successfully.
    Ready,
    /// Discovery failed and the connection must be finalized.
    Fail(Status),
    /// Read operation finished.
    ReadDone {
        index: usize,
        status: att::Result<()>,
        value: Vec<u8>,
    },
    /// Write operation finished.
    WriteDone {
        index: usize,
        status: att::Result<()>,
    },
}

/// Procedure that the engine must issue after a send grant.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Query {
    PrimaryService(Uuid),
    Characteristics(HandleRange),
    Descriptors(HandleRange),
    ClientCfg(Handle, Cccd),
    Read(Handle),
    Write(Handle, Vec<u8>),
}

/// Cache entry associated with a connection.
#[cfg(feature = "cache")]
#[derive(Clone, Copy, Debug)]
pub(super) struct CacheEntry {
    pub tag: cache::CacheTag,
    pub hash: u32,
    /// Whether the handles were discovered rather than restored.
    pub discovered: bool,
}

/// Discovery session for one service instance on one link.
#[derive(Debug)]
pub struct Connection {
    link: ConnHandle,
    cid: ConnectionId,
    service: Uuid,
    index: u8,
    range: Option<HandleRange>,
    chars: Vec<CharSlot>,
    state: State,
    pub(super) listening: bool,
    #[cfg(feature = "cache")]
    pub(super) cache: Option<CacheEntry>,
}

impl Connection {
    /// Creates a new connection that starts in `state` with `n` empty
    /// characteristic slots taken from `storage`.
    pub(super) fn new(
        link: ConnHandle,
        cid: ConnectionId,
        target: &Target,
        range: Option<HandleRange>,
        mut storage: Vec<CharSlot>,
        n: usize,
        state: State,
    ) -> Self {
        storage.truncate(n);
        storage.fill(CharSlot::default());
        Self {
            link,
            cid,
            service: target.service,
            index: target.index,
            range,
            chars: storage,
            state,
            listening: false,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    /// Returns the link handle.
    #[inline(always)]
    #[must_use]
    pub const fn link(&self) -> ConnHandle {
        self.link
    }

    /// Returns the connection identifier.
    #[inline(always)]
    #[must_use]
    pub const fn cid(&self) -> ConnectionId {
        self.cid
    }

    /// Returns the service UUID.
    #[inline(always)]
    #[must_use]
    pub const fn service(&self) -> Uuid {
        self.service
    }

    /// Returns the service index.
    #[inline(always)]
    #[must_use]
    pub const fn service_index(&self) -> u8 {
        self.index
    }

    /// Returns the service handle range or `None` if the service was not
    /// discovered yet.
    #[inline(always)]
    #[must_use]
    pub const fn range(&self) -> Option<HandleRange> {
        self.range
    }

    /// Returns the current state.
    #[inline(always)]
    #[must_use]
    pub const fn state(&self) -> &State {
        &self.state
    }

    /// Returns the characteristic slots in declaration order.
    #[inline(always)]
    #[must_use]
    pub fn chars(&self) -> &[CharSlot] {
        &self.chars
    }

    /// Returns the value handle of the characteristic at `index`.
    #[inline]
    #[must_use]
    pub fn value_handle(&self, index: usize) -> Option<Handle> {
        self.chars.get(index).and_then(|c| c.value)
    }

    /// Returns the index of the characteristic with value handle `hdl`.
    #[must_use]
    pub fn index_of(&self, hdl: Handle) -> Option<usize> {
        self.chars.iter().position(|c| c.value == Some(hdl))
    }

    /// Returns the routing context for `client`.
    #[inline(always)]
    pub(super) const fn ctx(&self, client: ServiceClientId) -> Context {
        Context {
            client,
            cid: self.cid,
        }
    }

    /// Returns whether `hdl` is within the service range.
    #[inline]
    pub(super) fn covers(&self, hdl: Handle) -> bool {
        self.range.map_or(false, |r| r.contains(&hdl))
    }

    /// Checks whether the characteristic at `index` can be read or written.
    pub(super) fn can_query(&self, index: usize) -> Result<(), Status> {
        if !self.state.is_connected() {
            return Err(Status::CommandDisallowed);
        }
        if self.value_handle(index).is_none() {
            return Err(Status::UnsupportedFeatureOrParameterValue);
        }
        Ok(())
    }

    /// Starts a read or write operation.
    pub(super) fn start_op(&mut self, op: Op) -> Result<(), Status> {
        match self.state {
            State::Connected(Op::Idle) => {
                self.state = State::Connected(op);
                Ok(())
            }
            State::Connected(_) => Err(Status::ControllerBusy),
            _ => Err(Status::CommandDisallowed),
        }
    }

    /// Cancels an operation that could not be requested.
    pub(super) fn cancel_op(&mut self) {
        if self.state.is_connected() {
            self.state = State::Connected(Op::Idle);
        }
    }

    /// Restores characteristic value handles from a cache entry and marks the
    /// connection as connected.
    #[cfg(feature = "cache")]
    pub(super) fn restore(&mut self, range: HandleRange, handles: &[Option<Handle>]) {
        for (c, &h) in self.chars.iter_mut().zip(handles) {
            *c = CharSlot {
                value: h,
                ..CharSlot::default()
            };
        }
        self.range = Some(range);
        self.state = State::Connected(Op::Idle);
    }

    /// Marks discovery as finished.
    pub(super) fn set_connected(&mut self) {
        self.state = State::Connected(Op::Idle);
    }

    /// Advances the state after a send grant and returns the procedure to
    /// issue.
    pub(super) fn grant(&mut self) -> Option<Query> {
        use State::*;
        let (next, q) = match std::mem::replace(&mut self.state, WantPrimaryService) {
            WantPrimaryService => (
                AwaitPrimaryService { found: false },
                Query::PrimaryService(self.service),
            ),
            WantCharacteristics => {
                let range = self.range.unwrap_or_default();
                (AwaitCharacteristics, Query::Characteristics(range))
            }
            WantDescriptors(i) => match self.chars[i].desc_range() {
                Some(r) => (AwaitDescriptors(i), Query::Descriptors(r)),
                None => unreachable!("descriptor query without descriptor range"),
            },
            WantNotification(i) => {
                let c = &self.chars[i];
                match c.cfg {
                    Some(h) => (AwaitNotification(i), Query::ClientCfg(h, c.props.subscribe_cfg())),
                    None => unreachable!("notification without configuration handle"),
                }
            }
            Connected(Op::WantRead(i)) => match self.chars[i].value {
                Some(h) => (
                    Connected(Op::AwaitRead {
                        index: i,
                        value: Vec::new(),
                    }),
                    Query::Read(h),
                ),
                None => unreachable!("read without value handle"),
            },
            Connected(Op::WantWrite { index, value }) => match self.chars[index].value {
                Some(h) => (Connected(Op::AwaitWrite(index)), Query::Write(h, value)),
                None => unreachable!("write without value handle"),
            },
            st => {
                trace!("Ignoring send grant for {:?} in {st:?}", self.cid);
                self.state = st;
                return None;
            }
        };
        self.state = next;
        Some(q)
    }

    /// Handles a primary service result.
    pub(super) fn on_service(&mut self, info: ServiceInfo) {
        match self.state {
            State::AwaitPrimaryService { ref mut found } if !*found => {
                debug!("{:?} found service {} at {:?}", self.cid, info.uuid, info.range);
                self.range = Some(info.range);
                *found = true;
            }
            State::AwaitPrimaryService { .. } => {
                debug!("{:?} ignoring additional service instance at {:?}", self.cid, info.range);
            }
            ref st => warn!("Unexpected service result for {:?} in {st:?}", self.cid),
        }
    }

    /// Handles a characteristic result by assigning it to the first empty slot
    /// with a matching UUID. Results outside of the service range are dropped.
    pub(super) fn on_characteristic(&mut self, uuids: &[Uuid], decl: CharDecl) {
        if self.state != State::AwaitCharacteristics {
            warn!("Unexpected characteristic result for {:?} in {:?}", self.cid, self.state);
            return;
        }
        if !self.covers(decl.value) {
            warn!(
                "{:?} ignoring characteristic {} outside of service at {:?}",
                self.cid, decl.uuid, decl.value
            );
            return;
        }
        let slot = (uuids.iter().zip(self.chars.iter_mut()))
            .find(|(u, c)| **u == decl.uuid && c.value.is_none())
            .map(|(_, c)| c);
        let Some(c) = slot else {
            trace!("{:?} ignoring characteristic {} at {:?}", self.cid, decl.uuid, decl.value);
            return;
        };
        *c = CharSlot {
            value: Some(decl.value),
            end: Some(decl.end),
            props: decl.props,
            cfg: None,
        };
        debug!("{:?} found characteristic {} at {:?} ({:?})", self.cid, decl.uuid, decl.value, decl.props);
    }

    /// Handles a descriptor result, recording the Client Characteristic
    /// Configuration descriptor of the current characteristic.
    pub(super) fn on_descriptor(&mut self, desc: DescInfo) {
        let State::AwaitDescriptors(i) = self.state else {
            warn!("Unexpected descriptor result for {:?} in {:?}", self.cid, self.state);
            return;
        };
        if desc.uuid == Descriptor::ClientCharacteristicConfiguration {
            debug!("{:?} found CCCD for characteristic {i} at {:?}", self.cid, desc.hdl);
            self.chars[i].cfg = Some(desc.hdl);
        }
    }

    /// Handles a characteristic value read result.
    pub(super) fn on_value(&mut self, hdl: Handle, v: &[u8]) {
        match self.state {
            State::Connected(Op::AwaitRead {
                index,
                ref mut value,
            }) if self.chars[index].value == Some(hdl) => {
                value.clear();
                value.extend_from_slice(v);
            }
            ref st => warn!("Unexpected value for {hdl} on {:?} in {st:?}", self.cid),
        }
    }

    /// Handles procedure completion.
    pub(super) fn on_complete(&mut self, r: att::Result<()>) -> Next {
        use State::*;
        if !self.state.is_waiting() {
            warn!("Unexpected completion for {:?} in {:?}", self.cid, self.state);
            return Next::Wait;
        }
        match (std::mem::replace(&mut self.state, WantPrimaryService), r) {
            (Connected(Op::AwaitRead { index, value }), status) => {
                self.state = Connected(Op::Idle);
                let value = if status.is_ok() { value } else { Vec::new() };
                Next::ReadDone {
                    index,
                    status,
                    value,
                }
            }
            (Connected(Op::AwaitWrite(index)), status) => {
                self.state = Connected(Op::Idle);
                Next::WriteDone { index, status }
            }
            (AwaitNotification(i), Err(e)) => {
                warn!("{:?} failed to configure characteristic {i}: {e}", self.cid);
                self.chars[i].cfg = None;
                self.next_notification(i + 1)
            }
            (AwaitNotification(i), Ok(())) => self.next_notification(i + 1),
            (st, Err(e)) => {
                warn!("{:?} discovery failed in {st:?}: {e}", self.cid);
                self.state = st;
                Next::Fail(Status::from(e))
            }
            (AwaitPrimaryService { found: false }, Ok(())) => {
                debug!("{:?} service {} not found", self.cid, self.service);
                self.state = AwaitPrimaryService { found: false };
                Next::Fail(Status::UnsupportedFeatureOrParameterValue)
            }
            (AwaitPrimaryService { found: true }, Ok(())) => {
                self.state = WantCharacteristics;
                Next::Request
            }
            (AwaitCharacteristics, Ok(())) => self.next_descriptor(0),
            (AwaitDescriptors(i), Ok(())) => self.next_descriptor(i + 1),
            (st, Ok(())) => unreachable!("completion in {st:?}"),
        }
    }

    /// Selects the next characteristic at or after `i` that needs descriptor
    /// discovery. Characteristics that support notifications but have no room
    /// for descriptors are left without a configuration handle.
    fn next_descriptor(&mut self, i: usize) -> Next {
        let next = (self.chars.iter().enumerate().skip(i))
            .find(|(_, c)| c.can_subscribe() && c.desc_range().is_some())
            .map(|(i, _)| i);
        match next {
            Some(i) => {
                self.state = State::WantDescriptors(i);
                Next::Request
            }
            None => self.next_notification(0),
        }
    }

    /// Selects the next characteristic at or after `i` that has a
    /// configuration handle.
    fn next_notification(&mut self, i: usize) -> Next {
        let next = (self.chars.iter().enumerate().skip(i))
            .find(|(_, c)| c.cfg.is_some())
            .map(|(i, _)| i);
        match next {
            Some(i) => {
                self.state = State::WantNotification(i);
                Next::Request
            }
            None => Next::Ready,
        }
    }
}
