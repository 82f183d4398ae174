use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::att::{self, Handle, HandleRange};
use crate::gap::Uuid;
use crate::hci::{ConnHandle, Status};

use super::*;

/// Service client event handler.
pub type Handler = Box<dyn FnMut(&ClientEvent<'_>)>;

/// Registered service client.
struct Client {
    uuids: SmallVec<[Uuid; 8]>,
    handler: Handler,
    conns: BTreeMap<ConnectionId, Connection>,
    last_cid: Option<ConnectionId>,
}

impl Client {
    /// Delivers an event to the client handler.
    #[inline]
    fn emit(&mut self, e: &ClientEvent<'_>) {
        trace!("{e:?}");
        (self.handler)(e);
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uuids", &self.uuids)
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

/// Registry of service clients and the engine driving their connections.
#[derive(Debug)]
pub struct ServiceClients<T> {
    t: T,
    clients: BTreeMap<ServiceClientId, Client>,
    last_id: Option<ServiceClientId>,
    #[cfg(feature = "cache")]
    store: Option<Box<dyn cache::CacheStore>>,
}

impl<T: Transport> ServiceClients<T> {
    /// Creates an engine that issues procedures via transport `t`.
    #[inline]
    #[must_use]
    pub fn new(t: T) -> Self {
        Self {
            t,
            clients: BTreeMap::new(),
            last_id: None,
            #[cfg(feature = "cache")]
            store: None,
        }
    }

    /// Attaches a store for discovered handle layouts.
    #[cfg(feature = "cache")]
    #[inline]
    #[must_use]
    pub fn with_cache(mut self, store: impl cache::CacheStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Returns the transport.
    #[inline(always)]
    pub const fn transport(&self) -> &T {
        &self.t
    }

    /// Returns the transport.
    #[inline(always)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.t
    }

    /// Registers a service client that wants the characteristics in `uuids`,
    /// in that order. Characteristic indices used by all other methods refer to
    /// positions in this list.
    ///
    /// # Panics
    ///
    /// Panics if `uuids` has more than [`MAX_CHARS`] entries, mixes 16- and
    /// 128-bit UUIDs, or if all client identifiers are in use.
    pub fn register<U: Into<Uuid>>(
        &mut self,
        uuids: impl IntoIterator<Item = U>,
        handler: impl FnMut(&ClientEvent<'_>) + 'static,
    ) -> ServiceClientId {
        let uuids: SmallVec<[Uuid; 8]> = uuids.into_iter().map(Into::into).collect();
        assert!(uuids.len() <= MAX_CHARS, "too many characteristics");
        assert!(
            uuids.iter().all(|u| u.is_short()) || uuids.iter().all(|u| !u.is_short()),
            "16- and 128-bit characteristic UUIDs cannot be mixed"
        );
        let id = ServiceClientId::next_free(self.last_id, |id| self.clients.contains_key(&id))
            .expect("service client identifiers exhausted");
        debug!("Registered {id} for {uuids:?}");
        self.last_id = Some(id);
        self.clients.insert(
            id,
            Client {
                uuids,
                handler: Box::new(handler),
                conns: BTreeMap::new(),
                last_cid: None,
            },
        );
        id
    }

    /// Removes a service client and finalizes all of its connections without
    /// emitting any events.
    ///
    /// # Panics
    ///
    /// Panics if the client is not registered.
    pub fn unregister(&mut self, client: ServiceClientId) {
        let c = (self.clients.remove(&client)).expect("unknown service client");
        for conn in c.conns.into_values() {
            if conn.listening {
                self.t.stop_listening(conn.link(), conn.ctx(client));
            }
        }
        debug!("Unregistered {client}");
    }

    /// Returns the UUID of the characteristic at `index`.
    #[must_use]
    pub fn char_uuid(&self, client: ServiceClientId, index: usize) -> Option<Uuid> {
        self.client(client).uuids.get(index).copied()
    }

    /// Returns the number of characteristics declared by the client.
    #[must_use]
    pub fn char_count(&self, client: ServiceClientId) -> usize {
        self.client(client).uuids.len()
    }

    /// Returns an active connection.
    #[must_use]
    pub fn connection(&self, client: ServiceClientId, cid: ConnectionId) -> Option<&Connection> {
        self.client(client).conns.get(&cid)
    }

    /// Returns all active connections of a client.
    pub fn connections(&self, client: ServiceClientId) -> impl Iterator<Item = &Connection> {
        self.client(client).conns.values()
    }

    /// Returns the ATT_MTU of the connection's link.
    #[must_use]
    pub fn mtu(&self, client: ServiceClientId, cid: ConnectionId) -> Option<u16> {
        (self.connection(client, cid)).and_then(|c| self.t.mtu(c.link()))
    }

    /// Connects to a primary service instance on `link`. The connection starts
    /// with service discovery unless a matching cache entry is found, in which
    /// case it is connected immediately. `storage` must have room for all
    /// characteristics declared by the client.
    pub fn connect(
        &mut self,
        link: ConnHandle,
        client: ServiceClientId,
        target: Target,
        storage: Vec<CharSlot>,
    ) -> Result<ConnectionId, Status> {
        let c = self.client(client);
        if (c.conns.values()).any(|c| c.link() == link && c.service_index() == target.index) {
            return Err(Status::CommandDisallowed);
        }
        self.start(link, client, target, None, storage, State::WantPrimaryService)
    }

    /// Connects to a service instance with a known handle range, such as a
    /// secondary service found via an include declaration. Discovery starts
    /// with the characteristics of `range`. The client may not have another
    /// connection on `link` with the same service index or an overlapping
    /// range.
    pub fn connect_secondary(
        &mut self,
        link: ConnHandle,
        client: ServiceClientId,
        target: Target,
        range: HandleRange,
        storage: Vec<CharSlot>,
    ) -> Result<ConnectionId, Status> {
        let c = self.client(client);
        if (c.conns.values()).any(|c| {
            c.link() == link
                && (c.service_index() == target.index
                    || c.range().map_or(false, |r| r.overlaps(range)))
        }) {
            return Err(Status::CommandDisallowed);
        }
        self.start(link, client, target, Some(range), storage, State::WantCharacteristics)
    }

    /// Creates a connection and requests the first procedure.
    fn start(
        &mut self,
        link: ConnHandle,
        client: ServiceClientId,
        target: Target,
        range: Option<HandleRange>,
        storage: Vec<CharSlot>,
        state: State,
    ) -> Result<ConnectionId, Status> {
        let c = self.client_mut(client);
        let n = c.uuids.len();
        if storage.len() < n {
            debug!("At least {n} characteristic slots needed");
            return Err(Status::MemoryCapacityExceeded);
        }
        let Some(cid) = ConnectionId::next_free(c.last_cid, |id| c.conns.contains_key(&id)) else {
            return Err(Status::MemoryCapacityExceeded);
        };
        c.last_cid = Some(cid);
        let mut conn = Connection::new(link, cid, &target, range, storage, n, state);
        let ctx = conn.ctx(client);
        debug!("Connecting {ctx:?} to {} #{} on {link}", target.service, target.index);

        #[cfg(feature = "cache")]
        if let Some(tag) = target.cache {
            let search = range.unwrap_or(HandleRange::ALL);
            let hash = cache::request_hash(tag.db_hash, n, target.service, target.index, search);
            let restored = self.restore(tag, hash, n);
            conn.cache = Some(CacheEntry {
                tag,
                hash,
                discovered: restored.is_none(),
            });
            if let Some(handles) = restored {
                info!("{ctx:?} restored {n} characteristics from cache");
                conn.restore(search, &handles);
                self.client_mut(client).conns.insert(cid, conn);
                self.ready(ctx);
                return Ok(cid);
            }
        }

        if let Err(st) = self.t.request_to_send(link, ctx) {
            warn!("Failed to request send for {ctx:?}: {st}");
            return Err(st);
        }
        self.client_mut(client).conns.insert(cid, conn);
        Ok(cid)
    }

    /// Disconnects a connection, emitting [`ClientEvent::Disconnected`].
    pub fn disconnect(&mut self, client: ServiceClientId, cid: ConnectionId) -> Result<(), Status> {
        let ctx = Context { client, cid };
        let conn = self.finalize(ctx).ok_or(Status::UnknownConnectionIdentifier)?;
        self.client_mut(client).emit(&ClientEvent::Disconnected {
            link: conn.link(),
            cid,
        });
        Ok(())
    }

    /// Checks whether the characteristic at `index` can be read or written.
    pub fn can_query(
        &self,
        client: ServiceClientId,
        cid: ConnectionId,
        index: usize,
    ) -> Result<(), Status> {
        let conn = (self.connection(client, cid)).ok_or(Status::UnknownConnectionIdentifier)?;
        conn.can_query(index)
    }

    /// Reads the value of the characteristic at `index`. The result is
    /// delivered as [`ClientEvent::ReadValue`].
    pub fn read(
        &mut self,
        client: ServiceClientId,
        cid: ConnectionId,
        index: usize,
    ) -> Result<(), Status> {
        self.begin_op(Context { client, cid }, index, Op::WantRead(index))
    }

    /// Writes the value of the characteristic at `index`. The result is
    /// delivered as [`ClientEvent::WriteDone`].
    pub fn write(
        &mut self,
        client: ServiceClientId,
        cid: ConnectionId,
        index: usize,
        value: &[u8],
    ) -> Result<(), Status> {
        if value.len() > att::MAX_VAL_LEN {
            return Err(Status::ParameterOutOfMandatoryRange);
        }
        let op = Op::WantWrite {
            index,
            value: value.to_vec(),
        };
        self.begin_op(Context { client, cid }, index, op)
    }

    /// Starts a characteristic value operation.
    fn begin_op(&mut self, ctx: Context, index: usize, op: Op) -> Result<(), Status> {
        let Some(conn) = self.client_mut(ctx.client).conns.get_mut(&ctx.cid) else {
            return Err(Status::UnknownConnectionIdentifier);
        };
        conn.can_query(index)?;
        conn.start_op(op)?;
        let link = conn.link();
        self.t.request_to_send(link, ctx).map_err(|st| {
            if let Some(conn) = self.conn_mut(ctx) {
                conn.cancel_op();
            }
            st
        })
    }

    /// Handles a transport event.
    pub fn handle(&mut self, e: Event) {
        trace!("{e:?}");
        let ctx = match e {
            Event::Disconnected(link) => return self.on_disconnect(link),
            ref e => e.context().expect("event without context"),
        };
        let Some(client) = self.clients.get_mut(&ctx.client) else {
            debug!("Ignoring event for unregistered {}", ctx.client);
            return;
        };
        let Some(conn) = client.conns.get_mut(&ctx.cid) else {
            debug!("Ignoring stale event for {ctx:?}");
            return;
        };
        match e {
            Event::CanSendNow(_) => self.issue(ctx),
            Event::Service(_, info) => conn.on_service(info),
            Event::Characteristic(_, decl) => conn.on_characteristic(&client.uuids, decl),
            Event::Descriptor(_, desc) => conn.on_descriptor(desc),
            Event::Value(_, hdl, v) => conn.on_value(hdl, &v),
            Event::QueryComplete(_, r) => {
                let next = conn.on_complete(r);
                self.advance(ctx, next);
            }
            Event::Update {
                hdl, kind, value, ..
            } => {
                let Some(index) = conn.index_of(hdl).filter(|_| conn.listening) else {
                    trace!("Ignoring {kind} for {hdl} on {ctx:?}");
                    return;
                };
                let link = conn.link();
                client.emit(&ClientEvent::Value {
                    link,
                    cid: ctx.cid,
                    index,
                    kind,
                    value: &value,
                });
            }
            Event::Disconnected(_) => unreachable!(),
        }
    }

    /// Issues the procedure for which a send grant was received.
    fn issue(&mut self, ctx: Context) {
        let Some(conn) = self.conn_mut(ctx) else { return };
        let link = conn.link();
        let Some(q) = conn.grant() else { return };
        trace!("{ctx:?} issuing {q:?}");
        let r = match q {
            Query::PrimaryService(uuid) => self.t.discover_primary_service(link, uuid, ctx),
            Query::Characteristics(range) => self.t.discover_characteristics(link, range, ctx),
            Query::Descriptors(range) => self.t.discover_descriptors(link, range, ctx),
            Query::ClientCfg(hdl, cfg) => self.t.write_client_cfg(link, hdl, cfg, ctx),
            Query::Read(hdl) => self.t.read_value(link, hdl, ctx),
            Query::Write(hdl, ref v) => self.t.write_value(link, hdl, v, ctx),
        };
        let Err(st) = r else { return };
        warn!("{ctx:?} failed to issue {q:?}: {st}");
        match q {
            Query::ClientCfg(..) | Query::Read(_) | Query::Write(..) => {
                let Some(conn) = self.conn_mut(ctx) else { return };
                let next = conn.on_complete(Err(att::ErrorCode::UnlikelyError));
                self.advance(ctx, next);
            }
            _ => self.fail(ctx, st),
        }
    }

    /// Performs the action requested by a connection state change.
    fn advance(&mut self, ctx: Context, next: Next) {
        match next {
            Next::Wait => {}
            Next::Request => {
                let Some(conn) = self.conn_mut(ctx) else { return };
                let link = conn.link();
                if let Err(st) = self.t.request_to_send(link, ctx) {
                    warn!("Failed to request send for {ctx:?}: {st}");
                    self.fail(ctx, st);
                }
            }
            Next::Ready => self.ready(ctx),
            Next::Fail(st) => self.fail(ctx, st),
            Next::ReadDone {
                index,
                status,
                value,
            } => self.client_mut(ctx.client).emit(&ClientEvent::ReadValue {
                cid: ctx.cid,
                index,
                status,
                value: &value,
            }),
            Next::WriteDone { index, status } => {
                self.client_mut(ctx.client).emit(&ClientEvent::WriteDone {
                    cid: ctx.cid,
                    index,
                    status,
                });
            }
        }
    }

    /// Completes discovery: subscribes to value updates, stores the handle
    /// layout, and reports success.
    fn ready(&mut self, ctx: Context) {
        let Some(conn) = self.conn_mut(ctx) else { return };
        conn.set_connected();
        let link = conn.link();
        if let Some(range) = conn.range() {
            conn.listening = true;
            self.t.listen(link, range, ctx);
        }
        #[cfg(feature = "cache")]
        self.save(ctx);
        info!("{ctx:?} connected on {link}");
        self.client_mut(ctx.client).emit(&ClientEvent::Connected {
            link,
            cid: ctx.cid,
            status: Status::Success,
        });
    }

    /// Finalizes a connection after a discovery failure and reports `st`.
    fn fail(&mut self, ctx: Context, st: Status) {
        let Some(conn) = self.finalize(ctx) else { return };
        warn!("{ctx:?} failed to connect: {st}");
        self.client_mut(ctx.client).emit(&ClientEvent::Connected {
            link: conn.link(),
            cid: ctx.cid,
            status: st,
        });
    }

    /// Finalizes all connections on a disconnected link.
    fn on_disconnect(&mut self, link: ConnHandle) {
        let ctxs: Vec<Context> = (self.clients.iter())
            .flat_map(|(&client, c)| {
                (c.conns.values())
                    .filter(|conn| conn.link() == link)
                    .map(move |conn| conn.ctx(client))
            })
            .collect();
        for ctx in ctxs {
            debug!("{ctx:?} lost {link}");
            self.disconnect(ctx.client, ctx.cid).ok();
        }
    }

    /// Removes a connection and its listener. Events delivered for the
    /// connection afterwards are ignored.
    fn finalize(&mut self, ctx: Context) -> Option<Connection> {
        let conn = self.client_mut(ctx.client).conns.remove(&ctx.cid)?;
        if conn.listening {
            self.t.stop_listening(conn.link(), ctx);
        }
        trace!("Finalized {ctx:?}");
        Some(conn)
    }

    /// Returns a connection.
    #[inline]
    fn conn_mut(&mut self, ctx: Context) -> Option<&mut Connection> {
        (self.clients.get_mut(&ctx.client)).and_then(|c| c.conns.get_mut(&ctx.cid))
    }

    /// Returns a registered client.
    #[inline]
    fn client(&self, id: ServiceClientId) -> &Client {
        (self.clients.get(&id)).expect("unknown service client")
    }

    /// Returns a registered client.
    #[inline]
    fn client_mut(&mut self, id: ServiceClientId) -> &mut Client {
        (self.clients.get_mut(&id)).expect("unknown service client")
    }
}

#[cfg(feature = "cache")]
impl<T: Transport> ServiceClients<T> {
    /// Loads value handles from the cache if the stored request hash matches.
    fn restore(&self, tag: cache::CacheTag, hash: u32, n: usize) -> Option<Vec<Option<Handle>>> {
        let blob = self.store.as_ref()?.load(tag.key())?;
        match cache::decode(&blob) {
            Ok((h, handles)) if h == hash && handles.len() == n => Some(handles),
            Ok(_) => {
                debug!("Cache entry {:?} is stale", tag.key());
                None
            }
            Err(e) => {
                warn!("Invalid cache entry {:?}: {e}", tag.key());
                None
            }
        }
    }

    /// Stores the discovered value handles of a connection.
    fn save(&self, ctx: Context) {
        let (Some(store), Some(conn)) = (self.store.as_ref(), self.connection(ctx.client, ctx.cid))
        else {
            return;
        };
        let Some(e) = conn.cache.filter(|e| e.discovered) else {
            return;
        };
        let handles: SmallVec<[Option<Handle>; 8]> = conn.chars().iter().map(|c| c.value).collect();
        match cache::encode(e.hash, &handles) {
            Ok(blob) if store.save(e.tag.key(), blob.as_ref()) => {
                debug!("{ctx:?} stored {} characteristics in cache", handles.len());
            }
            Ok(_) => warn!("{ctx:?} failed to store cache entry"),
            Err(err) => warn!("{ctx:?} cache entry not stored: {err}"),
        }
    }
}
