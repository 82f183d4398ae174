//! Link Loss Service client ([LLS]).
//!
//! The Link Loss Service defines the behavior of a device when the link is
//! lost. The client reads and writes the Alert Level that the server uses
//! after a disconnection.
//!
//! [LLS]: https://www.bluetooth.com/specifications/specs/link-loss-service-1-0-1/

use tracing::warn;

use crate::att::{self, ErrorCode};
use crate::gap::{Characteristic, Service};
use crate::gatt::client::{
    CharSlot, ClientEvent, ConnectionId, ServiceClientId, ServiceClients, Target, Transport,
};
use crate::hci::{ConnHandle, Status};

/// Index of the Alert Level characteristic.
const ALERT_LEVEL: usize = 0;

/// Alert Level characteristic value.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    strum::Display,
)]
#[repr(u8)]
pub enum AlertLevel {
    #[default]
    NoAlert = 0x00,
    MildAlert = 0x01,
    HighAlert = 0x02,
}

/// Link Loss Service client event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LinkLossEvent {
    /// Service discovery finished.
    Connected {
        link: ConnHandle,
        cid: ConnectionId,
        status: Status,
    },
    /// The connection was removed.
    Disconnected { link: ConnHandle, cid: ConnectionId },
    /// Result of [`LinkLossClient::read_alert_level`]. `level` is `NoAlert`
    /// on error.
    AlertLevel {
        cid: ConnectionId,
        status: att::Result<()>,
        level: AlertLevel,
    },
    /// Result of [`LinkLossClient::write_alert_level`].
    WriteDone {
        cid: ConnectionId,
        status: att::Result<()>,
    },
}

impl LinkLossEvent {
    /// Translates a service client event.
    fn from_client(e: &ClientEvent<'_>) -> Option<Self> {
        Some(match *e {
            ClientEvent::Connected { link, cid, status } => Self::Connected { link, cid, status },
            ClientEvent::Disconnected { link, cid } => Self::Disconnected { link, cid },
            ClientEvent::ReadValue {
                cid,
                index: ALERT_LEVEL,
                status,
                value,
            } => {
                let r = status.and_then(|()| match *value {
                    [v] => AlertLevel::try_from(v).map_err(|_| ErrorCode::ValueNotAllowed),
                    _ => Err(ErrorCode::InvalidAttributeValueLength),
                });
                if let (Ok(()), Err(e)) = (status, r) {
                    warn!("Invalid alert level {value:02X?}: {e}");
                }
                Self::AlertLevel {
                    cid,
                    status: r.map(|_| ()),
                    level: r.unwrap_or_default(),
                }
            }
            ClientEvent::WriteDone {
                cid,
                index: ALERT_LEVEL,
                status,
            } => Self::WriteDone { cid, status },
            _ => return None,
        })
    }
}

/// Link Loss Service client handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkLossClient {
    id: ServiceClientId,
}

impl LinkLossClient {
    /// Registers a Link Loss Service client that delivers events to `f`.
    pub fn register<T: Transport>(
        sc: &mut ServiceClients<T>,
        mut f: impl FnMut(LinkLossEvent) + 'static,
    ) -> Self {
        let id = sc.register([Characteristic::AlertLevel], move |e| {
            if let Some(e) = LinkLossEvent::from_client(e) {
                f(e);
            }
        });
        Self { id }
    }

    /// Returns the service client identifier.
    #[inline(always)]
    #[must_use]
    pub const fn id(self) -> ServiceClientId {
        self.id
    }

    /// Connects to the Link Loss Service on `link`.
    pub fn connect<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        link: ConnHandle,
    ) -> Result<ConnectionId, Status> {
        let t = Target::new(Service::LinkLoss);
        sc.connect(link, self.id, t, vec![CharSlot::default()])
    }

    /// Reads the alert level. The result is delivered as
    /// [`LinkLossEvent::AlertLevel`].
    #[inline]
    pub fn read_alert_level<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        cid: ConnectionId,
    ) -> Result<(), Status> {
        sc.read(self.id, cid, ALERT_LEVEL)
    }

    /// Writes the alert level, which must be one of the [`AlertLevel`]
    /// values. The result is delivered as [`LinkLossEvent::WriteDone`].
    pub fn write_alert_level<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        cid: ConnectionId,
        level: u8,
    ) -> Result<(), Status> {
        if sc.connection(self.id, cid).is_none() {
            return Err(Status::UnknownConnectionIdentifier);
        }
        let level = AlertLevel::try_from(level).map_err(|_| Status::ParameterOutOfMandatoryRange)?;
        sc.write(self.id, cid, ALERT_LEVEL, &[u8::from(level)])
    }

    /// Disconnects from the service.
    #[inline]
    pub fn disconnect<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        cid: ConnectionId,
    ) -> Result<(), Status> {
        sc.disconnect(self.id, cid)
    }

    /// Unregisters the client without emitting any events.
    #[inline]
    pub fn unregister<T: Transport>(self, sc: &mut ServiceClients<T>) {
        sc.unregister(self.id);
    }
}
