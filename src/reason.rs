//! MQTT 5 reason code enumerations.
//!
//! Every reason code is a single byte, packet-kind specific. Unknown
//! values are a malformed packet at decode time.

use crate::error::{Error, Result};

macro_rules! reason_code {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            /// Decode from the wire byte.
            pub fn from_u8(byte: u8) -> Result<Self> {
                match byte {
                    $($value => Ok(Self::$variant),)+
                    other => Err(Error::Malformed(format!(
                        concat!(stringify!($name), " reason code {:#04x}"),
                        other
                    ))),
                }
            }

            /// Encode to the wire byte.
            pub fn to_u8(self) -> u8 {
                self as u8
            }

            /// True for any success-family code (value < 0x80).
            pub fn is_success(self) -> bool {
                self.to_u8() < 0x80
            }
        }
    };
}

reason_code!(
    /// CONNACK reason code.
    ConnectReasonCode {
        Success = 0x00,
        V311UnacceptableProtocolVersion = 0x01,
        V311IdentifierRejected = 0x02,
        V311ServerUnavailable = 0x03,
        V311BadUserNameOrPassword = 0x04,
        V311NotAuthorized = 0x05,
        UnspecifiedError = 0x80,
        MalformedPacket = 0x81,
        ProtocolError = 0x82,
        ImplementationSpecificError = 0x83,
        UnsupportedProtocolVersion = 0x84,
        ClientIdentifierNotValid = 0x85,
        BadUserNameOrPassword = 0x86,
        NotAuthorized = 0x87,
        ServerUnavailable = 0x88,
        ServerBusy = 0x89,
        Banned = 0x8A,
        BadAuthenticationMethod = 0x8C,
        TopicNameInvalid = 0x90,
        PacketTooLarge = 0x95,
        QuotaExceeded = 0x97,
        PayloadFormatInvalid = 0x99,
        RetainNotSupported = 0x9A,
        QoSNotSupported = 0x9B,
        UseAnotherServer = 0x9C,
        ServerMoved = 0x9D,
        ConnectionRateExceeded = 0x9F,
    }
);

reason_code!(
    /// DISCONNECT reason code.
    DisconnectReasonCode {
        NormalDisconnection = 0x00,
        DisconnectWithWillMessage = 0x04,
        UnspecifiedError = 0x80,
        MalformedPacket = 0x81,
        ProtocolError = 0x82,
        ImplementationSpecificError = 0x83,
        NotAuthorized = 0x87,
        ServerBusy = 0x89,
        ServerShuttingDown = 0x8B,
        KeepAliveTimeout = 0x8D,
        SessionTakenOver = 0x8E,
        TopicFilterInvalid = 0x8F,
        TopicNameInvalid = 0x90,
        ReceiveMaximumExceeded = 0x93,
        TopicAliasInvalid = 0x94,
        PacketTooLarge = 0x95,
        MessageRateTooHigh = 0x96,
        QuotaExceeded = 0x97,
        AdministrativeAction = 0x98,
        PayloadFormatInvalid = 0x99,
        RetainNotSupported = 0x9A,
        QoSNotSupported = 0x9B,
        UseAnotherServer = 0x9C,
        ServerMoved = 0x9D,
        SharedSubscriptionsNotSupported = 0x9E,
        ConnectionRateExceeded = 0x9F,
        MaximumConnectTime = 0xA0,
        SubscriptionIdentifiersNotSupported = 0xA1,
        WildcardSubscriptionsNotSupported = 0xA2,
    }
);

reason_code!(
    /// SUBACK reason code (one per requested filter).
    SubackReasonCode {
        GrantedQoS0 = 0x00,
        GrantedQoS1 = 0x01,
        GrantedQoS2 = 0x02,
        UnspecifiedError = 0x80,
        ImplementationSpecificError = 0x83,
        NotAuthorized = 0x87,
        TopicFilterInvalid = 0x8F,
        PacketIdentifierInUse = 0x91,
        QuotaExceeded = 0x97,
        SharedSubscriptionsNotSupported = 0x9E,
        SubscriptionIdentifiersNotSupported = 0xA1,
        WildcardSubscriptionsNotSupported = 0xA2,
    }
);

reason_code!(
    /// UNSUBACK reason code (one per filter).
    UnsubackReasonCode {
        Success = 0x00,
        NoSubscriptionExisted = 0x11,
        UnspecifiedError = 0x80,
        ImplementationSpecificError = 0x83,
        NotAuthorized = 0x87,
        TopicFilterInvalid = 0x8F,
        PacketIdentifierInUse = 0x91,
    }
);

reason_code!(
    /// PUBACK reason code.
    PubackReasonCode {
        Success = 0x00,
        NoMatchingSubscribers = 0x10,
        UnspecifiedError = 0x80,
        ImplementationSpecificError = 0x83,
        NotAuthorized = 0x87,
        TopicNameInvalid = 0x90,
        PacketIdentifierInUse = 0x91,
        QuotaExceeded = 0x97,
        PayloadFormatInvalid = 0x99,
    }
);

reason_code!(
    /// PUBREC reason code (same closed set as PUBACK).
    PubrecReasonCode {
        Success = 0x00,
        NoMatchingSubscribers = 0x10,
        UnspecifiedError = 0x80,
        ImplementationSpecificError = 0x83,
        NotAuthorized = 0x87,
        TopicNameInvalid = 0x90,
        PacketIdentifierInUse = 0x91,
        QuotaExceeded = 0x97,
        PayloadFormatInvalid = 0x99,
    }
);

reason_code!(
    /// PUBREL reason code.
    PubrelReasonCode {
        Success = 0x00,
        PacketIdentifierNotFound = 0x92,
    }
);

reason_code!(
    /// PUBCOMP reason code (same closed set as PUBREL).
    PubcompReasonCode {
        Success = 0x00,
        PacketIdentifierNotFound = 0x92,
    }
);

reason_code!(
    /// AUTH reason code.
    AuthReasonCode {
        Success = 0x00,
        ContinueAuthentication = 0x18,
        ReAuthenticate = 0x19,
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_known_values() {
        assert_eq!(ConnectReasonCode::from_u8(0x00).unwrap(), ConnectReasonCode::Success);
        assert_eq!(ConnectReasonCode::Success.to_u8(), 0x00);
        assert_eq!(
            ConnectReasonCode::from_u8(0x8C).unwrap(),
            ConnectReasonCode::BadAuthenticationMethod
        );
        assert_eq!(
            DisconnectReasonCode::from_u8(0x9F).unwrap(),
            DisconnectReasonCode::ConnectionRateExceeded
        );
    }

    #[test]
    fn rejects_unknown_value() {
        assert!(ConnectReasonCode::from_u8(0xFF).is_err());
        assert!(SubackReasonCode::from_u8(0x03).is_err());
    }

    #[test]
    fn success_classification() {
        assert!(SubackReasonCode::GrantedQoS2.is_success());
        assert!(!SubackReasonCode::NotAuthorized.is_success());
    }
}
