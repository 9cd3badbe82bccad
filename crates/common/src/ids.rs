use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is a distinct type so a booking id can never be passed
/// where a payment id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifier linking every message that belongs to one saga instance.
    CorrelationId
);

uuid_id!(
    /// Booking owned by the booking service.
    BookingId
);

uuid_id!(
    /// Payment owned by the payment service.
    PaymentId
);

uuid_id!(
    /// Customer placing the booking.
    CustomerId
);

uuid_id!(
    /// Craftsperson receiving the booking and the payment.
    CraftspersonId
);

uuid_id!(
    /// Opaque handle of a scheduled timeout, used to cancel it.
    TimeoutTokenId
);

uuid_id!(
    /// Identifier of a dead-lettered side effect.
    DeadLetterId
);

/// Namespace for deterministic timeout tokens.
const TIMEOUT_TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_93d4_4b57_a0e2_5d7c_19b3_e846);

impl TimeoutTokenId {
    /// Derives the token for a timeout armed by a saga at a given version.
    ///
    /// The same inputs always yield the same token, so re-running a
    /// transition after a concurrency conflict arms an identical timeout.
    pub fn derive(correlation_id: CorrelationId, kind: &str, version: i64) -> Self {
        let name = format!("{}/{}/{}", correlation_id, kind, version);
        Self(Uuid::new_v5(&TIMEOUT_TOKEN_NAMESPACE, name.as_bytes()))
    }
}
