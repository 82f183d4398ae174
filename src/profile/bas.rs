//! Battery Service client ([BAS]).
//!
//! The Battery Service exposes the battery level of a device as a percentage.
//! The client subscribes to level notifications when the server supports them.
//!
//! [BAS]: https://www.bluetooth.com/specifications/specs/battery-service/

use tracing::warn;

use crate::att::{self, ErrorCode};
use crate::gap::{Characteristic, Service};
use crate::gatt::client::{
    CharSlot, ClientEvent, ConnectionId, ServiceClientId, ServiceClients, Target, Transport,
};
use crate::hci::{ConnHandle, Status};

/// Index of the Battery Level characteristic.
const LEVEL: usize = 0;

/// Battery Service client event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BatteryEvent {
    /// Service discovery finished.
    Connected {
        link: ConnHandle,
        cid: ConnectionId,
        status: Status,
    },
    /// The connection was removed.
    Disconnected { link: ConnHandle, cid: ConnectionId },
    /// Battery level in percent, either read or notified. `level` is 0 on
    /// error.
    Level {
        cid: ConnectionId,
        status: att::Result<()>,
        level: u8,
    },
}

impl BatteryEvent {
    /// Translates a service client event.
    fn from_client(e: &ClientEvent<'_>) -> Option<Self> {
        let (cid, status, value) = match *e {
            ClientEvent::Connected { link, cid, status } => {
                return Some(Self::Connected { link, cid, status })
            }
            ClientEvent::Disconnected { link, cid } => return Some(Self::Disconnected { link, cid }),
            ClientEvent::Value {
                cid, index, value, ..
            } if index == LEVEL => (cid, Ok(()), value),
            ClientEvent::ReadValue {
                cid,
                index,
                status,
                value,
            } if index == LEVEL => (cid, status, value),
            _ => return None,
        };
        Some(match (status, value) {
            (Ok(()), &[level]) => Self::Level {
                cid,
                status: Ok(()),
                level,
            },
            (Ok(()), v) => {
                warn!("Invalid battery level length: {}", v.len());
                Self::Level {
                    cid,
                    status: Err(ErrorCode::InvalidAttributeValueLength),
                    level: 0,
                }
            }
            (Err(e), _) => Self::Level {
                cid,
                status: Err(e),
                level: 0,
            },
        })
    }
}

/// Battery Service client handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatteryClient {
    id: ServiceClientId,
}

impl BatteryClient {
    /// Registers a Battery Service client that delivers events to `f`.
    pub fn register<T: Transport>(
        sc: &mut ServiceClients<T>,
        mut f: impl FnMut(BatteryEvent) + 'static,
    ) -> Self {
        let id = sc.register([Characteristic::BatteryLevel], move |e| {
            if let Some(e) = BatteryEvent::from_client(e) {
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

    /// Connects to Battery Service instance `index` on `link`.
    pub fn connect<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        link: ConnHandle,
        index: u8,
    ) -> Result<ConnectionId, Status> {
        let t = Target::new(Service::Battery).with_index(index);
        sc.connect(link, self.id, t, vec![CharSlot::default()])
    }

    /// Connects to Battery Service instance `index` on `link`, skipping
    /// discovery if `tag` identifies a stored handle layout.
    #[cfg(feature = "cache")]
    pub fn connect_cached<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        link: ConnHandle,
        index: u8,
        tag: crate::gatt::client::cache::CacheTag,
    ) -> Result<ConnectionId, Status> {
        let t = Target::new(Service::Battery).with_index(index).with_cache(tag);
        sc.connect(link, self.id, t, vec![CharSlot::default()])
    }

    /// Reads the battery level. The result is delivered as
    /// [`BatteryEvent::Level`].
    #[inline]
    pub fn read_level<T: Transport>(
        self,
        sc: &mut ServiceClients<T>,
        cid: ConnectionId,
    ) -> Result<(), Status> {
        sc.read(self.id, cid, LEVEL)
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
