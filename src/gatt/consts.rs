use bitflags::bitflags;

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct CharProps: u8 {
        /// Permits broadcasts of the Characteristic Value using Server
        /// Characteristic Configuration Descriptor.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permit writes of the Characteristic Value without response.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment. If set, the Client Characteristic Configuration
        /// Descriptor shall exist.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        /// If set, the Client Characteristic Configuration Descriptor shall
        /// exist.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Additional characteristic properties are defined in the
        /// Characteristic Extended Properties Descriptor.
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharProps {
    /// Properties that require a Client Characteristic Configuration
    /// descriptor.
    pub const SUBSCRIBE: Self = Self::NOTIFY.union(Self::INDICATE);

    /// Returns the configuration that subscribes to value updates, preferring
    /// indications over notifications. Returns an empty value if the
    /// characteristic supports neither.
    #[inline]
    #[must_use]
    pub const fn subscribe_cfg(self) -> Cccd {
        if self.contains(Self::INDICATE) {
            Cccd::INDICATE
        } else if self.contains(Self::NOTIFY) {
            Cccd::NOTIFY
        } else {
            Cccd::empty()
        }
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified. This value can only be
        /// set if the characteristic's properties have the `NOTIFY` bit set.
        const NOTIFY = 1 << 0;
        /// The Characteristic Value shall be indicated. This value can only be
        /// set if the characteristic's properties have the `INDICATE` bit set.
        const INDICATE = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_cfg() {
        assert_eq!(CharProps::READ.subscribe_cfg(), Cccd::empty());
        assert_eq!(CharProps::NOTIFY.subscribe_cfg(), Cccd::NOTIFY);
        assert_eq!(CharProps::SUBSCRIBE.subscribe_cfg(), Cccd::INDICATE);
        assert_eq!(Cccd::INDICATE.bits(), 0x0002);
        assert!(CharProps::from_bits_truncate(0x12).intersects(CharProps::SUBSCRIBE));
    }
}
