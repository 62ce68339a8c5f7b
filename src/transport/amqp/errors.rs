//! Classification of `lapin` errors
//!
//! Soft channel errors arrive as `lapin::Error::ProtocolError` carrying the
//! AMQP reply kind. The kind alone decides between a missing entity, a
//! conflicting redeclaration, a refused access and a transient fault; the
//! reply text is kept for the message only.

use crate::transport::BrokerError;
use lapin::protocol::{AMQPError, AMQPErrorKind, AMQPSoftError};

/// Map a `lapin` error to the broker error taxonomy
pub fn classify_lapin_error(error: &lapin::Error) -> BrokerError {
    let text = error.to_string();
    match error {
        lapin::Error::ProtocolError(amqp) => classify_amqp_error(amqp, text),
        lapin::Error::IOError(_) => BrokerError::Io(text),
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed(text),
        lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed(text),
        _ => BrokerError::Protocol(text),
    }
}

fn classify_amqp_error(error: &AMQPError, text: String) -> BrokerError {
    match error.kind() {
        AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(text),
        AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
            BrokerError::PreconditionFailed(text)
        }
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => BrokerError::AccessRefused(text),
        _ => BrokerError::Protocol(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol_error(kind: AMQPSoftError, text: &str) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(AMQPErrorKind::Soft(kind), text.into()))
    }

    #[test]
    fn test_not_found_reply() {
        let error = classify_lapin_error(&protocol_error(
            AMQPSoftError::NOTFOUND,
            "NOT_FOUND - no exchange 'orders' in vhost '/'",
        ));
        assert!(matches!(error, BrokerError::NotFound(_)));
    }

    #[test]
    fn test_precondition_failed_reply() {
        let error = classify_lapin_error(&protocol_error(
            AMQPSoftError::PRECONDITIONFAILED,
            "PRECONDITION_FAILED - inequivalent arg 'type' for exchange 'orders' in vhost '/': \
             received 'fanout' but current is 'topic'",
        ));
        assert!(matches!(error, BrokerError::PreconditionFailed(_)));
    }

    #[test]
    fn test_entity_names_with_reply_codes_do_not_change_the_class() {
        let refused = classify_lapin_error(&protocol_error(
            AMQPSoftError::ACCESSREFUSED,
            "ACCESS_REFUSED - access to exchange 'audit-404' in vhost '/' refused for user 'app'",
        ));
        assert!(matches!(refused, BrokerError::AccessRefused(_)));
        assert!(!refused.is_transient());

        let conflict = classify_lapin_error(&protocol_error(
            AMQPSoftError::PRECONDITIONFAILED,
            "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange 'orders-404'",
        ));
        assert!(matches!(conflict, BrokerError::PreconditionFailed(_)));

        let missing = classify_lapin_error(&protocol_error(
            AMQPSoftError::NOTFOUND,
            "NOT_FOUND - no queue 'retry-406' in vhost '/'",
        ));
        assert!(matches!(missing, BrokerError::NotFound(_)));
    }

    #[test]
    fn test_other_soft_errors_are_protocol_errors() {
        let error = classify_lapin_error(&protocol_error(
            AMQPSoftError::RESOURCELOCKED,
            "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue 'jobs'",
        ));
        assert!(matches!(error, BrokerError::Protocol(_)));
    }
}
