//! Simulated transport backed by an in-process GATT server.
//!
//! Each link has its own attribute database and a FIFO of send requests. A
//! request is granted only when no procedure is outstanding on the link, so
//! the engine's serialization is exercised the same way as over a real bearer.
//! Events are produced by [`Sim::next_event`] and can be fed to the engine one
//! at a time or all at once with [`ServiceClients::run`].

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::att::{ErrorCode, Handle, HandleRange, MAX_VAL_LEN, DEFAULT_MTU};
use crate::gap::{Descriptor, Uuid};
use crate::hci::{ConnHandle, Status};

use super::*;

/// Procedure type, used for fault injection and for checking which
/// procedures were issued.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum QueryKind {
    PrimaryService,
    Characteristics,
    Descriptors,
    ClientCfg,
    Read,
    Write,
}

/// Simulated characteristic.
#[derive(Clone, Debug)]
struct SimChar {
    decl: CharDecl,
    descs: Vec<DescInfo>,
    value: Vec<u8>,
}

impl SimChar {
    /// Returns the handle of the Client Characteristic Configuration
    /// descriptor.
    fn cccd(&self) -> Option<Handle> {
        (self.descs.iter())
            .find(|d| d.uuid == Descriptor::ClientCharacteristicConfiguration)
            .map(|d| d.hdl)
    }
}

/// Simulated service.
#[derive(Clone, Debug)]
struct SimService {
    info: ServiceInfo,
    primary: bool,
    chars: Vec<SimChar>,
}

/// Attribute database of a simulated server. Handles are assigned
/// sequentially in the order that attributes are added.
#[derive(Clone, Debug)]
pub struct Db {
    services: Vec<SimService>,
    next: u16,
}

impl Default for Db {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            next: 1,
        }
    }
}

impl Db {
    /// Creates an empty database.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a primary service and returns its handle range.
    pub fn primary(
        &mut self,
        uuid: impl Into<Uuid>,
        f: impl FnOnce(&mut ServiceBuilder),
    ) -> HandleRange {
        self.service(uuid.into(), true, f)
    }

    /// Adds a secondary service and returns its handle range.
    pub fn secondary(
        &mut self,
        uuid: impl Into<Uuid>,
        f: impl FnOnce(&mut ServiceBuilder),
    ) -> HandleRange {
        self.service(uuid.into(), false, f)
    }

    /// Leaves `n` unused handles before the next service.
    pub fn skip(&mut self, n: u16) -> &mut Self {
        self.next += n;
        self
    }

    fn service(
        &mut self,
        uuid: Uuid,
        primary: bool,
        f: impl FnOnce(&mut ServiceBuilder),
    ) -> HandleRange {
        let start = self.next;
        let mut b = ServiceBuilder {
            next: start + 1,
            chars: Vec::new(),
        };
        f(&mut b);
        let range = HandleRange::from_raw(start, b.next - 1).expect("invalid service range");
        let mut chars = b.chars;
        let ends: Vec<Handle> = (chars.iter().skip(1))
            .map(|c| c.decl.decl.prev().expect("invalid declaration handle"))
            .chain([range.end()])
            .collect();
        for (c, end) in chars.iter_mut().zip(ends) {
            c.decl.end = end;
        }
        self.next = b.next;
        self.services.push(SimService {
            info: ServiceInfo { range, uuid },
            primary,
            chars,
        });
        range
    }

    fn chars(&self) -> impl Iterator<Item = &SimChar> {
        self.services.iter().flat_map(|s| s.chars.iter())
    }

    fn char_mut(&mut self, value: Handle) -> Option<&mut SimChar> {
        (self.services.iter_mut())
            .flat_map(|s| s.chars.iter_mut())
            .find(|c| c.decl.value == value)
    }
}

/// Builder of service characteristics.
#[derive(Debug)]
pub struct ServiceBuilder {
    next: u16,
    chars: Vec<SimChar>,
}

impl ServiceBuilder {
    /// Adds a characteristic declaration and value.
    pub fn characteristic(
        &mut self,
        uuid: impl Into<Uuid>,
        props: CharProps,
        value: &[u8],
    ) -> &mut Self {
        let decl = self.alloc();
        let value_hdl = self.alloc();
        self.chars.push(SimChar {
            decl: CharDecl {
                decl,
                value: value_hdl,
                end: value_hdl,
                props,
                uuid: uuid.into(),
            },
            descs: Vec::new(),
            value: value.to_vec(),
        });
        self
    }

    /// Adds a descriptor to the last characteristic.
    pub fn descriptor(&mut self, uuid: impl Into<Uuid>) -> &mut Self {
        let hdl = self.alloc();
        let c = (self.chars.last_mut()).expect("descriptor without characteristic");
        c.descs.push(DescInfo {
            hdl,
            uuid: uuid.into(),
        });
        self
    }

    /// Adds a Client Characteristic Configuration descriptor to the last
    /// characteristic.
    #[inline]
    pub fn cccd(&mut self) -> &mut Self {
        self.descriptor(Descriptor::ClientCharacteristicConfiguration)
    }

    fn alloc(&mut self) -> Handle {
        let h = Handle::new(self.next).expect("handle space exhausted");
        self.next += 1;
        h
    }
}

/// Simulated link state.
#[derive(Debug)]
struct Link {
    link: ConnHandle,
    db: Db,
    mtu: u16,
    busy: Option<Context>,
    granted: Option<Context>,
    waiting: VecDeque<Context>,
    listeners: Vec<(Context, HandleRange)>,
    cfg: Vec<(Handle, Cccd)>,
    faults: Vec<(QueryKind, ErrorCode)>,
    refusals: Vec<(QueryKind, Status)>,
}

/// Simulated GATT client transport.
#[derive(Debug, Default)]
pub struct Sim {
    links: Vec<Link>,
    events: VecDeque<Event>,
    issued: Vec<(ConnHandle, QueryKind)>,
    violations: usize,
}

impl Sim {
    /// Creates a transport without any links.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connected link to a server with database `db`.
    pub fn connect(&mut self, link: ConnHandle, db: Db) {
        assert!(self.link(link).is_none(), "{link} already connected");
        self.links.push(Link {
            link,
            db,
            mtu: DEFAULT_MTU,
            busy: None,
            granted: None,
            waiting: VecDeque::new(),
            listeners: Vec::new(),
            cfg: Vec::new(),
            faults: Vec::new(),
            refusals: Vec::new(),
        });
    }

    /// Disconnects a link. Events already queued for the link are still
    /// delivered before the disconnection event.
    pub fn disconnect(&mut self, link: ConnHandle) {
        self.links.retain(|l| l.link != link);
        self.events.push_back(Event::Disconnected(link));
    }

    /// Sets the ATT_MTU of a link.
    pub fn set_mtu(&mut self, link: ConnHandle, mtu: u16) {
        if let Some(l) = self.link_mut(link) {
            l.mtu = mtu;
        }
    }

    /// Makes the next procedure of type `kind` on `link` fail with `err`.
    pub fn fail(&mut self, link: ConnHandle, kind: QueryKind, err: ErrorCode) {
        if let Some(l) = self.link_mut(link) {
            l.faults.push((kind, err));
        }
    }

    /// Makes the transport refuse to start the next procedure of type `kind`
    /// on `link` with status `st`. The send grant is consumed.
    pub fn refuse(&mut self, link: ConnHandle, kind: QueryKind, st: Status) {
        if let Some(l) = self.link_mut(link) {
            l.refusals.push((kind, st));
        }
    }

    /// Sends a notification or indication for value handle `hdl`, depending
    /// on how the client configured the characteristic. Returns whether the
    /// update was delivered to any listener.
    pub fn notify(&mut self, link: ConnHandle, hdl: Handle, value: &[u8]) -> bool {
        let Some(l) = self.link(link) else { return false };
        let Some(cccd) = l.db.chars().find(|c| c.decl.value == hdl).and_then(SimChar::cccd) else {
            return false;
        };
        let cfg = (l.cfg.iter().find(|&&(h, _)| h == cccd)).map_or(Cccd::empty(), |&(_, v)| v);
        let kind = if cfg.contains(Cccd::INDICATE) {
            ValueKind::Indication
        } else if cfg.contains(Cccd::NOTIFY) {
            ValueKind::Notification
        } else {
            trace!("{hdl} not configured");
            return false;
        };
        let ctxs: Vec<Context> = (l.listeners.iter())
            .filter(|(_, r)| r.contains(&hdl))
            .map(|&(ctx, _)| ctx)
            .collect();
        for &ctx in &ctxs {
            self.events.push_back(Event::Update {
                ctx,
                hdl,
                kind,
                value: value.to_vec(),
            });
        }
        !ctxs.is_empty()
    }

    /// Returns the Client Characteristic Configuration written at `hdl`.
    #[must_use]
    pub fn client_cfg(&self, link: ConnHandle, hdl: Handle) -> Cccd {
        (self.link(link))
            .and_then(|l| l.cfg.iter().find(|&&(h, _)| h == hdl))
            .map_or(Cccd::empty(), |&(_, v)| v)
    }

    /// Returns the current value of a characteristic.
    #[must_use]
    pub fn value(&self, link: ConnHandle, hdl: Handle) -> Option<&[u8]> {
        (self.link(link))
            .and_then(|l| l.db.chars().find(|c| c.decl.value == hdl))
            .map(|c| c.value.as_slice())
    }

    /// Returns the number of listeners registered on a link.
    #[must_use]
    pub fn listeners(&self, link: ConnHandle) -> usize {
        self.link(link).map_or(0, |l| l.listeners.len())
    }

    /// Returns all procedures issued so far.
    #[inline]
    #[must_use]
    pub fn issued(&self) -> &[(ConnHandle, QueryKind)] {
        &self.issued
    }

    /// Returns the number of procedures that were issued without a send grant
    /// or while another procedure was outstanding.
    #[inline]
    #[must_use]
    pub const fn violations(&self) -> usize {
        self.violations
    }

    /// Returns the next event to deliver to the engine. Pending send requests
    /// are granted once all other events have been delivered.
    pub fn next_event(&mut self) -> Option<Event> {
        if self.events.is_empty() {
            self.grant();
        }
        let e = self.events.pop_front()?;
        if let Event::QueryComplete(ctx, _) = e {
            for l in &mut self.links {
                if l.busy == Some(ctx) {
                    l.busy = None;
                }
            }
        }
        Some(e)
    }

    /// Grants the oldest send request on every idle link.
    fn grant(&mut self) {
        for l in &mut self.links {
            if l.busy.is_some() {
                continue;
            }
            if let Some(ctx) = l.waiting.pop_front() {
                trace!("Granting {ctx:?} on {}", l.link);
                l.granted = Some(ctx);
                self.events.push_back(Event::CanSendNow(ctx));
            }
        }
    }

    /// Starts a procedure. Returns the injected fault, if any, or the injected
    /// refusal.
    fn issue(
        &mut self,
        link: ConnHandle,
        ctx: Context,
        kind: QueryKind,
    ) -> Result<Option<ErrorCode>, Status> {
        let Some(l) = self.links.iter_mut().find(|l| l.link == link) else {
            return Err(Status::UnknownConnectionIdentifier);
        };
        if l.busy.is_some() || l.granted != Some(ctx) {
            warn!("{kind} issued by {ctx:?} without a send grant on {link}");
            self.violations += 1;
            return Err(Status::CommandDisallowed);
        }
        l.granted = None;
        if let Some(i) = l.refusals.iter().position(|&(k, _)| k == kind) {
            let st = l.refusals.remove(i).1;
            debug!("{ctx:?} {kind} on {link} refused ({st})");
            return Err(st);
        }
        l.busy = Some(ctx);
        self.issued.push((link, kind));
        let fault = (l.faults.iter().position(|&(k, _)| k == kind)).map(|i| l.faults.remove(i).1);
        debug!("{ctx:?} {kind} on {link}{}", fault.map_or(String::new(), |e| format!(" (fails with {e})")));
        Ok(fault)
    }

    /// Queues procedure results followed by the completion event.
    fn finish(&mut self, ctx: Context, fault: Option<ErrorCode>, results: Vec<Event>) {
        match fault {
            Some(e) => self.events.push_back(Event::QueryComplete(ctx, Err(e))),
            None => {
                self.events.extend(results);
                self.events.push_back(Event::QueryComplete(ctx, Ok(())));
            }
        }
    }

    fn link(&self, link: ConnHandle) -> Option<&Link> {
        self.links.iter().find(|l| l.link == link)
    }

    fn link_mut(&mut self, link: ConnHandle) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.link == link)
    }

    /// Returns the database of a link that must exist.
    fn db(&mut self, link: ConnHandle) -> &mut Db {
        &mut (self.link_mut(link)).expect("link disconnected").db
    }
}

impl Transport for Sim {
    fn request_to_send(&mut self, link: ConnHandle, ctx: Context) -> Result<(), Status> {
        let l = self.link_mut(link).ok_or(Status::UnknownConnectionIdentifier)?;
        l.waiting.push_back(ctx);
        Ok(())
    }

    fn discover_primary_service(
        &mut self,
        link: ConnHandle,
        uuid: Uuid,
        ctx: Context,
    ) -> Result<(), Status> {
        let fault = self.issue(link, ctx, QueryKind::PrimaryService)?;
        let results = (self.db(link).services.iter())
            .filter(|s| s.primary && s.info.uuid == uuid)
            .map(|s| Event::Service(ctx, s.info))
            .collect();
        self.finish(ctx, fault, results);
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        link: ConnHandle,
        range: HandleRange,
        ctx: Context,
    ) -> Result<(), Status> {
        let fault = self.issue(link, ctx, QueryKind::Characteristics)?;
        let results = (self.db(link).chars())
            .filter(|c| range.contains(&c.decl.decl))
            .map(|c| Event::Characteristic(ctx, c.decl))
            .collect();
        self.finish(ctx, fault, results);
        Ok(())
    }

    fn discover_descriptors(
        &mut self,
        link: ConnHandle,
        range: HandleRange,
        ctx: Context,
    ) -> Result<(), Status> {
        let fault = self.issue(link, ctx, QueryKind::Descriptors)?;
        let results = (self.db(link).chars())
            .flat_map(|c| c.descs.iter())
            .filter(|d| range.contains(&d.hdl))
            .map(|&d| Event::Descriptor(ctx, d))
            .collect();
        self.finish(ctx, fault, results);
        Ok(())
    }

    fn write_client_cfg(
        &mut self,
        link: ConnHandle,
        hdl: Handle,
        cfg: Cccd,
        ctx: Context,
    ) -> Result<(), Status> {
        let mut fault = self.issue(link, ctx, QueryKind::ClientCfg)?;
        let l = self.link_mut(link).expect("link disconnected");
        if fault.is_none() {
            if l.db.chars().any(|c| c.cccd() == Some(hdl)) {
                l.cfg.retain(|&(h, _)| h != hdl);
                l.cfg.push((hdl, cfg));
            } else {
                fault = Some(ErrorCode::InvalidHandle);
            }
        }
        self.finish(ctx, fault, Vec::new());
        Ok(())
    }

    fn read_value(&mut self, link: ConnHandle, hdl: Handle, ctx: Context) -> Result<(), Status> {
        let mut fault = self.issue(link, ctx, QueryKind::Read)?;
        let mut results = Vec::new();
        if fault.is_none() {
            match self.db(link).char_mut(hdl) {
                Some(c) => results.push(Event::Value(ctx, hdl, c.value.clone())),
                None => fault = Some(ErrorCode::InvalidHandle),
            }
        }
        self.finish(ctx, fault, results);
        Ok(())
    }

    fn write_value(
        &mut self,
        link: ConnHandle,
        hdl: Handle,
        value: &[u8],
        ctx: Context,
    ) -> Result<(), Status> {
        let mut fault = self.issue(link, ctx, QueryKind::Write)?;
        if fault.is_none() {
            fault = match self.db(link).char_mut(hdl) {
                Some(_) if value.len() > MAX_VAL_LEN => Some(ErrorCode::InvalidAttributeValueLength),
                Some(c) => {
                    c.value = value.to_vec();
                    None
                }
                None => Some(ErrorCode::InvalidHandle),
            };
        }
        self.finish(ctx, fault, Vec::new());
        Ok(())
    }

    fn listen(&mut self, link: ConnHandle, range: HandleRange, ctx: Context) {
        if let Some(l) = self.link_mut(link) {
            l.listeners.push((ctx, range));
        }
    }

    fn stop_listening(&mut self, link: ConnHandle, ctx: Context) {
        if let Some(l) = self.link_mut(link) {
            l.listeners.retain(|&(c, _)| c != ctx);
        }
    }

    fn mtu(&self, link: ConnHandle) -> Option<u16> {
        self.link(link).map(|l| l.mtu)
    }
}

impl ServiceClients<Sim> {
    /// Delivers simulated events to the engine until there are none left.
    /// Returns the number of events delivered.
    pub fn run(&mut self) -> usize {
        let mut n = 0;
        while let Some(e) = self.transport_mut().next_event() {
            self.handle(e);
            n += 1;
        }
        n
    }
}
