//! GATT service client engine ([Vol 3] Part G, Section 4).
//!
//! A profile client registers the ordered list of characteristic UUIDs that it
//! cares about and then connects to one instance of its service on a link. The
//! engine discovers the service, its characteristics and their Client
//! Characteristic Configuration descriptors, subscribes to value updates, and
//! reports [`ClientEvent::Connected`] when the connection is ready.
//!
//! The engine does not perform any I/O. ATT procedures are issued through the
//! [`Transport`] trait and their results are fed back via
//! [`ServiceClients::handle`]. Only one procedure may be outstanding on a link,
//! so every procedure is preceded by [`Transport::request_to_send`] and issued
//! only after the matching [`Event::CanSendNow`].

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;

pub use {conn::*, engine::*};

use crate::att::{self, Handle, HandleRange};
use crate::gap::Uuid;
use crate::gatt::{CharProps, Cccd};
use crate::hci::{ConnHandle, Status};
use crate::util::name_of;

#[cfg(feature = "cache")]
pub mod cache;
mod conn;
mod engine;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(test)]
mod tests;

/// Maximum number of characteristics per service client. The cache blob
/// stores the count in one byte.
pub const MAX_CHARS: usize = u8::MAX as usize;

/// Defines a non-zero `u16` identifier type.
macro_rules! id_type {
    ($(#[$outer:meta])* $t:ident) => {
        $(#[$outer])*
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $t(NonZeroU16);

        impl $t {
            /// Wraps a raw identifier. Returns `None` if the identifier is 0.
            #[inline]
            #[must_use]
            pub const fn new(v: u16) -> Option<Self> {
                match NonZeroU16::new(v) {
                    Some(nz) => Some(Self(nz)),
                    None => None,
                }
            }

            /// Returns the identifier following `self`, skipping 0 on
            /// wraparound.
            #[inline]
            #[must_use]
            const fn next(v: Option<Self>) -> Self {
                let n = match v {
                    Some(v) => v.0.get().wrapping_add(1),
                    None => 1,
                };
                // SAFETY: n is replaced with 1 when it wraps to 0
                Self(unsafe { NonZeroU16::new_unchecked(if n == 0 { 1 } else { n }) })
            }

            /// Returns the first identifier after `last` for which `used`
            /// returns `false`, or `None` if all identifiers are in use.
            fn next_free(last: Option<Self>, used: impl Fn(Self) -> bool) -> Option<Self> {
                let mut id = last;
                for _ in 0..u16::MAX {
                    let next = Self::next(id);
                    if !used(next) {
                        return Some(next);
                    }
                    id = Some(next);
                }
                None
            }
        }

        impl Debug for $t {
            #[allow(clippy::use_self)]
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", name_of!($t), self.0.get())
            }
        }

        impl Display for $t {
            #[inline]
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Debug::fmt(self, f)
            }
        }

        impl From<$t> for u16 {
            #[inline]
            fn from(v: $t) -> Self {
                v.0.get()
            }
        }
    };
}

id_type! {
    /// Service client identifier assigned by [`ServiceClients::register`].
    ServiceClientId
}

id_type! {
    /// Connection identifier returned by [`ServiceClients::connect`]. It is
    /// unique among the active connections of one service client and is
    /// distinct from the link handle.
    ConnectionId
}

/// Routing context attached to every transport procedure and echoed back in
/// every transport event.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Context {
    pub client: ServiceClientId,
    pub cid: ConnectionId,
}

/// Service discovered by the Discover Primary Service by Service UUID
/// procedure ([Vol 3] Part G, Section 4.4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    pub range: HandleRange,
    pub uuid: Uuid,
}

/// Characteristic declaration discovered by the Discover All Characteristics
/// of a Service procedure ([Vol 3] Part G, Section 4.6.1). `end` is the last
/// handle belonging to the characteristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CharDecl {
    pub decl: Handle,
    pub value: Handle,
    pub end: Handle,
    pub props: CharProps,
    pub uuid: Uuid,
}

/// Descriptor discovered by the Discover All Characteristic Descriptors
/// procedure ([Vol 3] Part G, Section 4.7.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DescInfo {
    pub hdl: Handle,
    pub uuid: Uuid,
}

/// Type of an unsolicited value update.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ValueKind {
    /// `ATT_HANDLE_VALUE_NTF` ([Vol 3] Part G, Section 4.10).
    Notification,
    /// `ATT_HANDLE_VALUE_IND` ([Vol 3] Part G, Section 4.11).
    Indication,
}

/// Event delivered by the transport to [`ServiceClients::handle`].
///
/// Discovery procedures deliver zero or more result events followed by exactly
/// one [`Event::QueryComplete`]. Running out of attributes (`AttributeNotFound`)
/// is the normal end of a discovery procedure and must be reported as `Ok(())`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// The link is free and the procedure requested for this context may be
    /// issued.
    CanSendNow(Context),
    /// Primary service result.
    Service(Context, ServiceInfo),
    /// Characteristic result.
    Characteristic(Context, CharDecl),
    /// Characteristic descriptor result.
    Descriptor(Context, DescInfo),
    /// Characteristic value read result.
    Value(Context, Handle, Vec<u8>),
    /// End of the current procedure.
    QueryComplete(Context, att::Result<()>),
    /// Notification or indication received by a listener registered with
    /// [`Transport::listen`].
    Update {
        ctx: Context,
        hdl: Handle,
        kind: ValueKind,
        value: Vec<u8>,
    },
    /// The link was disconnected.
    Disconnected(ConnHandle),
}

impl Event {
    /// Returns the routing context of the event, if any.
    #[inline]
    #[must_use]
    pub const fn context(&self) -> Option<Context> {
        match *self {
            Self::CanSendNow(ctx)
            | Self::Service(ctx, _)
            | Self::Characteristic(ctx, _)
            | Self::Descriptor(ctx, _)
            | Self::Value(ctx, ..)
            | Self::QueryComplete(ctx, _)
            | Self::Update { ctx, .. } => Some(ctx),
            Self::Disconnected(_) => None,
        }
    }
}

/// GATT client procedures used by the engine. Procedures other than
/// [`Transport::listen`] and [`Transport::stop_listening`] complete
/// asynchronously by delivering [`Event`]s tagged with the supplied context. An
/// `Err` return means that the procedure was not started and no events will
/// follow.
pub trait Transport {
    /// Requests an [`Event::CanSendNow`] for `ctx` once no other procedure is
    /// outstanding on the link. Requests are granted in FIFO order.
    fn request_to_send(&mut self, link: ConnHandle, ctx: Context) -> Result<(), Status>;

    /// Discover Primary Service by Service UUID.
    fn discover_primary_service(
        &mut self,
        link: ConnHandle,
        uuid: Uuid,
        ctx: Context,
    ) -> Result<(), Status>;

    /// Discover All Characteristics of a Service.
    fn discover_characteristics(
        &mut self,
        link: ConnHandle,
        range: HandleRange,
        ctx: Context,
    ) -> Result<(), Status>;

    /// Discover All Characteristic Descriptors within `range`.
    fn discover_descriptors(
        &mut self,
        link: ConnHandle,
        range: HandleRange,
        ctx: Context,
    ) -> Result<(), Status>;

    /// Writes the Client Characteristic Configuration descriptor at `hdl`.
    fn write_client_cfg(
        &mut self,
        link: ConnHandle,
        hdl: Handle,
        cfg: Cccd,
        ctx: Context,
    ) -> Result<(), Status>;

    /// Read Characteristic Value.
    fn read_value(&mut self, link: ConnHandle, hdl: Handle, ctx: Context) -> Result<(), Status>;

    /// Write Characteristic Value.
    fn write_value(
        &mut self,
        link: ConnHandle,
        hdl: Handle,
        value: &[u8],
        ctx: Context,
    ) -> Result<(), Status>;

    /// Delivers notifications and indications for value handles in `range` as
    /// [`Event::Update`].
    fn listen(&mut self, link: ConnHandle, range: HandleRange, ctx: Context);

    /// Removes the listener registered for `ctx`.
    fn stop_listening(&mut self, link: ConnHandle, ctx: Context);

    /// Returns the current ATT_MTU of the link.
    fn mtu(&self, link: ConnHandle) -> Option<u16>;
}

/// Event delivered to the service client handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ClientEvent<'a> {
    /// Discovery finished. The connection is usable if `status` is `Success`,
    /// otherwise it has already been removed.
    Connected {
        link: ConnHandle,
        cid: ConnectionId,
        status: Status,
    },
    /// The connection was removed because of a disconnect request or link
    /// loss.
    Disconnected { link: ConnHandle, cid: ConnectionId },
    /// Notification or indication for the characteristic at `index`.
    Value {
        link: ConnHandle,
        cid: ConnectionId,
        index: usize,
        kind: ValueKind,
        value: &'a [u8],
    },
    /// Result of [`ServiceClients::read`]. `value` is empty on error.
    ReadValue {
        cid: ConnectionId,
        index: usize,
        status: att::Result<()>,
        value: &'a [u8],
    },
    /// Result of [`ServiceClients::write`].
    WriteDone {
        cid: ConnectionId,
        index: usize,
        status: att::Result<()>,
    },
}

/// Service instance targeted by a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub struct Target {
    /// Service UUID.
    pub service: Uuid,
    /// Index distinguishing multiple instances of the same service on one
    /// link.
    pub index: u8,
    /// Cache entry used to skip discovery on reconnection.
    #[cfg(feature = "cache")]
    pub cache: Option<cache::CacheTag>,
}

impl Target {
    /// Creates a target for the first instance of `service`.
    #[inline]
    pub fn new(service: impl Into<Uuid>) -> Self {
        Self {
            service: service.into(),
            index: 0,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    /// Sets the service index.
    #[inline]
    pub const fn with_index(mut self, index: u8) -> Self {
        self.index = index;
        self
    }

    /// Sets the cache entry.
    #[cfg(feature = "cache")]
    #[inline]
    pub const fn with_cache(mut self, tag: cache::CacheTag) -> Self {
        self.cache = Some(tag);
        self
    }
}

/// Discovered handles of one declared characteristic. A `None` value handle
/// means that the server does not support the characteristic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CharSlot {
    pub value: Option<Handle>,
    pub end: Option<Handle>,
    pub props: CharProps,
    pub cfg: Option<Handle>,
}

impl CharSlot {
    /// Returns whether the characteristic value can be subscribed to.
    #[inline]
    #[must_use]
    pub fn can_subscribe(&self) -> bool {
        self.value.is_some() && self.props.intersects(CharProps::SUBSCRIBE)
    }

    /// Returns the handle range that may contain the characteristic's
    /// descriptors, or `None` if there is no room for any.
    #[must_use]
    pub fn desc_range(&self) -> Option<HandleRange> {
        let start = self.value?.next()?;
        let end = self.end?;
        HandleRange::from_raw(start.into(), end.into())
    }
}

/// Converts an ATT error into the status reported in
/// [`ClientEvent::Connected`].
impl From<att::ErrorCode> for Status {
    fn from(e: att::ErrorCode) -> Self {
        match e {
            att::ErrorCode::InvalidAttributeValueLength => Self::ParameterOutOfMandatoryRange,
            e => {
                tracing::warn!("ATT error {e} reported as unspecified");
                Self::UnspecifiedError
            }
        }
    }
}
