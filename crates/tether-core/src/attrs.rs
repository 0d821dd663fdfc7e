//! Transport attributes: the well-known facts about a connection.
//!
//! Attributes are populated incrementally (addresses and policy at
//! construction, peer identity and security level at setup) and are
//! immutable once the transport is ready.

use tether_channel::{ServiceAddress, Uid};

/// How strongly the transport protects traffic between the two processes.
///
/// Trust is derived from kernel-reported process identity, not cryptography:
/// traffic never leaves the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityLevel {
    /// Peer identity not yet established.
    #[default]
    None,
    /// The peer is authenticated and messages cannot be tampered with in
    /// transit.
    Integrity,
    /// Additionally, no other party can observe the messages.
    PrivacyAndIntegrity,
}

/// The default security-level attribution: same uid on both ends means the
/// messages never leave the process boundary of one app.
#[must_use]
pub fn default_security_level(remote_uid: Uid, local_uid: Uid) -> SecurityLevel {
    if remote_uid == local_uid {
        SecurityLevel::PrivacyAndIntegrity
    } else {
        SecurityLevel::Integrity
    }
}

/// Policy for structured payloads the peer may embed in inbound parcels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundParcelPolicy {
    /// Accept structured objects as metadata values.
    pub accept_structured_metadata: bool,
    /// Accept structured objects as message payloads.
    pub accept_structured_messages: bool,
}

/// The attribute set of one transport.
#[derive(Debug, Clone, Default)]
pub struct TransportAttrs {
    /// Our own address.
    pub local_address: Option<ServiceAddress>,
    /// The peer's address.
    pub remote_address: Option<ServiceAddress>,
    /// Kernel-reported uid of the peer process. Set on any active transport.
    pub remote_uid: Option<Uid>,
    /// The authority the server presents as.
    pub server_authority: Option<String>,
    /// Protection level of the connection.
    pub security_level: SecurityLevel,
    /// Structured-payload policy for inbound parcels.
    pub parcel_policy: InboundParcelPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_security_level() {
        assert_eq!(
            default_security_level(1000, 1000),
            SecurityLevel::PrivacyAndIntegrity
        );
        assert_eq!(default_security_level(1000, 2000), SecurityLevel::Integrity);
    }

    #[test]
    fn test_attrs_start_untrusted() {
        let attrs = TransportAttrs::default();
        assert_eq!(attrs.security_level, SecurityLevel::None);
        assert!(attrs.remote_uid.is_none());
    }
}
