uuid16_enum! {
    /// GATT services ([Assigned Numbers] Section 3.4).
    pub enum Service {
        GenericAccess = 0x1800,
        GenericAttribute = 0x1801,
        ImmediateAlert = 0x1802,
        LinkLoss = 0x1803,
        TxPower = 0x1804,
        CurrentTime = 0x1805,
        Glucose = 0x1808,
        DeviceInformation = 0x180A,
        HeartRate = 0x180D,
        Battery = 0x180F,
        HumanInterfaceDevice = 0x1812,
        ScanParameters = 0x1813,
        CyclingSpeedAndCadence = 0x1816,
        CyclingPower = 0x1818,
        ObjectTransfer = 0x1825,
        AudioInputControl = 0x1843,
        VolumeControl = 0x1844,
        VolumeOffsetControl = 0x1845,
        CoordinatedSetIdentification = 0x1846,
        MediaControl = 0x1848,
        GenericMediaControl = 0x1849,
        TelephoneBearer = 0x184B,
        GenericTelephoneBearer = 0x184C,
        MicrophoneControl = 0x184D,
    }
}

uuid16_enum! {
    /// GATT characteristic descriptors ([Assigned Numbers] Section 3.7).
    pub enum Descriptor {
        CharacteristicExtendedProperties = 0x2900,
        CharacteristicUserDescription = 0x2901,
        ClientCharacteristicConfiguration = 0x2902,
        ServerCharacteristicConfiguration = 0x2903,
        CharacteristicPresentationFormat = 0x2904,
        CharacteristicAggregateFormat = 0x2905,
        ReportReference = 0x2908,
    }
}

uuid16_enum! {
    /// GATT characteristics ([Assigned Numbers] Section 3.8).
    pub enum Characteristic {
        DeviceName = 0x2A00,
        Appearance = 0x2A01,
        ServiceChanged = 0x2A05,
        AlertLevel = 0x2A06,
        TxPowerLevel = 0x2A07,
        GlucoseMeasurement = 0x2A18,
        BatteryLevel = 0x2A19,
        SystemId = 0x2A23,
        ModelNumberString = 0x2A24,
        SerialNumberString = 0x2A25,
        FirmwareRevisionString = 0x2A26,
        HardwareRevisionString = 0x2A27,
        SoftwareRevisionString = 0x2A28,
        ManufacturerNameString = 0x2A29,
        ScanRefresh = 0x2A31,
        HeartRateMeasurement = 0x2A37,
        BodySensorLocation = 0x2A38,
        HidInformation = 0x2A4A,
        ReportMap = 0x2A4B,
        HidControlPoint = 0x2A4C,
        Report = 0x2A4D,
        ProtocolMode = 0x2A4E,
        ScanIntervalWindow = 0x2A4F,
        PnpId = 0x2A50,
        SensorLocation = 0x2A5D,
        CyclingPowerMeasurement = 0x2A63,
        CyclingPowerFeature = 0x2A65,
        ClientSupportedFeatures = 0x2B29,
        DatabaseHash = 0x2B2A,
        BearerProviderName = 0x2BB3,
        BearerUci = 0x2BB4,
        BearerTechnology = 0x2BB5,
        BearerSignalStrength = 0x2BB7,
        CallState = 0x2BBD,
    }
}
