//! Notifications raised by a [`Carrier`](crate::Carrier) while it updates.

use {
    crate::{
        connection::{ConnectionId, DisconnectReason},
        handle::CarrierHandle,
    },
    carrier_io::{DriverError, SecurityError},
};

/// Receives notifications from a [`Carrier`](crate::Carrier).
///
/// Every method runs at the end of
/// [`Carrier::update`](crate::Carrier::update), in the order the events
/// happened. Use the [`CarrierHandle`] to act on them; its commands take effect
/// on the next update.
///
/// A [`flume::Sender<CarrierEvent>`] forwards every event into a channel.
pub trait CarrierListener: Send {
    /// A peer connected to us and the handshake accepted it.
    fn on_incoming_connection(&mut self, carrier: &CarrierHandle, id: ConnectionId) {
        let _ = (carrier, id);
    }

    /// A connection we started did not complete its handshake.
    fn on_failed_to_connect(
        &mut self,
        carrier: &CarrierHandle,
        id: ConnectionId,
        reason: DisconnectReason,
    ) {
        let _ = (carrier, id, reason);
    }

    /// A connection we started completed its handshake.
    fn on_connection_established(&mut self, carrier: &CarrierHandle, id: ConnectionId) {
        let _ = (carrier, id);
    }

    /// An established connection ended.
    fn on_disconnect(
        &mut self,
        carrier: &CarrierHandle,
        id: ConnectionId,
        reason: DisconnectReason,
    ) {
        let _ = (carrier, id, reason);
    }

    /// The driver failed.
    ///
    /// `id` is [`ConnectionId::INVALID`] if the error concerns no connection in
    /// particular.
    fn on_driver_error(&mut self, carrier: &CarrierHandle, id: ConnectionId, error: &DriverError) {
        let _ = (carrier, id, error);
    }

    /// A security check failed. The connection stays up.
    fn on_security_error(
        &mut self,
        carrier: &CarrierHandle,
        id: ConnectionId,
        error: &SecurityError,
    ) {
        let _ = (carrier, id, error);
    }

    /// Congestion control changed the send rate of a connection.
    fn on_rate_change(&mut self, carrier: &CarrierHandle, id: ConnectionId, bytes_per_sec: u32) {
        let _ = (carrier, id, bytes_per_sec);
    }
}

/// Owned form of every [`CarrierListener`] notification.
#[derive(Debug, Clone)]
pub enum CarrierEvent {
    /// See [`CarrierListener::on_incoming_connection`].
    IncomingConnection {
        /// Connection.
        id: ConnectionId,
    },
    /// See [`CarrierListener::on_failed_to_connect`].
    FailedToConnect {
        /// Connection.
        id: ConnectionId,
        /// Why the handshake failed.
        reason: DisconnectReason,
    },
    /// See [`CarrierListener::on_connection_established`].
    ConnectionEstablished {
        /// Connection.
        id: ConnectionId,
    },
    /// See [`CarrierListener::on_disconnect`].
    Disconnect {
        /// Connection.
        id: ConnectionId,
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// See [`CarrierListener::on_driver_error`].
    DriverError {
        /// Connection, or [`ConnectionId::INVALID`].
        id: ConnectionId,
        /// What failed.
        error: DriverError,
    },
    /// See [`CarrierListener::on_security_error`].
    SecurityError {
        /// Connection.
        id: ConnectionId,
        /// What failed.
        error: SecurityError,
    },
    /// See [`CarrierListener::on_rate_change`].
    RateChange {
        /// Connection.
        id: ConnectionId,
        /// New send rate.
        bytes_per_sec: u32,
    },
}

impl CarrierEvent {
    /// Gets the connection that this event concerns.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        match self {
            Self::IncomingConnection { id }
            | Self::FailedToConnect { id, .. }
            | Self::ConnectionEstablished { id }
            | Self::Disconnect { id, .. }
            | Self::DriverError { id, .. }
            | Self::SecurityError { id, .. }
            | Self::RateChange { id, .. } => *id,
        }
    }

    /// Calls the [`CarrierListener`] method matching this event.
    pub fn dispatch(&self, listener: &mut dyn CarrierListener, carrier: &CarrierHandle) {
        match self {
            Self::IncomingConnection { id } => listener.on_incoming_connection(carrier, *id),
            Self::FailedToConnect { id, reason } => {
                listener.on_failed_to_connect(carrier, *id, *reason);
            }
            Self::ConnectionEstablished { id } => {
                listener.on_connection_established(carrier, *id);
            }
            Self::Disconnect { id, reason } => listener.on_disconnect(carrier, *id, *reason),
            Self::DriverError { id, error } => listener.on_driver_error(carrier, *id, error),
            Self::SecurityError { id, error } => listener.on_security_error(carrier, *id, error),
            Self::RateChange { id, bytes_per_sec } => {
                listener.on_rate_change(carrier, *id, *bytes_per_sec);
            }
        }
    }
}

impl CarrierListener for flume::Sender<CarrierEvent> {
    fn on_incoming_connection(&mut self, _: &CarrierHandle, id: ConnectionId) {
        let _ = self.send(CarrierEvent::IncomingConnection { id });
    }

    fn on_failed_to_connect(&mut self, _: &CarrierHandle, id: ConnectionId, reason: DisconnectReason) {
        let _ = self.send(CarrierEvent::FailedToConnect { id, reason });
    }

    fn on_connection_established(&mut self, _: &CarrierHandle, id: ConnectionId) {
        let _ = self.send(CarrierEvent::ConnectionEstablished { id });
    }

    fn on_disconnect(&mut self, _: &CarrierHandle, id: ConnectionId, reason: DisconnectReason) {
        let _ = self.send(CarrierEvent::Disconnect { id, reason });
    }

    fn on_driver_error(&mut self, _: &CarrierHandle, id: ConnectionId, error: &DriverError) {
        let _ = self.send(CarrierEvent::DriverError {
            id,
            error: error.clone(),
        });
    }

    fn on_security_error(&mut self, _: &CarrierHandle, id: ConnectionId, error: &SecurityError) {
        let _ = self.send(CarrierEvent::SecurityError {
            id,
            error: error.clone(),
        });
    }

    fn on_rate_change(&mut self, _: &CarrierHandle, id: ConnectionId, bytes_per_sec: u32) {
        let _ = self.send(CarrierEvent::RateChange { id, bytes_per_sec });
    }
}
