//! MAP notification client.
//!
//! When a client registers for notifications, the server connects back to
//! the client's notification service and pushes event reports. The client
//! here is a small state machine in the same sans-io shape as the server
//! engine: calls return [`ClientOutput`]s for the driver to carry out, and
//! the driver feeds responses and timer expiries back in.
//!
//! Every request arms a response timer. If the peer stays silent the client
//! drops the link and reports [`NotifyError::Timeout`].

use crate::config::NotifyConfig;
use crate::error::NotifyError;
use crate::packet::{
    AppParams, ConnId, Headers, PeerAddress, ResponseCode, TARGET_MESSAGE_NOTIFICATION,
    TYPE_EVENT_REPORT, TransferBuffer, body_capacity,
};
use crate::registry::InstanceId;
use std::time::Duration;

/// Notification client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// No link
    Idle,
    /// Connect sent
    Connecting,
    /// Connected, no push outstanding
    Connected,
    /// Event report being pushed
    Pushing,
    /// Disconnect sent
    Disconnecting,
}

/// Requests the client sends to the notification server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Connect to the notification service
    Connect {
        /// Largest packet we accept
        max_packet_len: u16,
        /// Headers (target)
        headers: Headers,
    },
    /// One packet of an event report
    Put {
        /// Packet headers
        headers: Headers,
        /// Last packet of the object
        final_bit: bool,
    },
    /// Disconnect
    Disconnect {
        /// Headers (connection id)
        headers: Headers,
    },
}

/// Outputs of the notification client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutput {
    /// Send a request on the link
    Send(ClientRequest),
    /// Drop the link without a Disconnect
    DropLink,
    /// Arm the response timer; expiry is reported with the same serial
    ArmTimer {
        /// Delay
        after: Duration,
        /// Serial to pass to [`NotificationClient::on_timeout`]
        serial: u64,
    },
    /// Status for the application
    Event(NotifyEvent),
}

/// Status reported to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// Link to the notification service is up
    Connected,
    /// An event report was accepted
    Delivered {
        /// Report size in bytes
        bytes: usize,
    },
    /// Link closed
    Disconnected,
    /// Request failed; the link is down
    Failed(NotifyError),
}

#[derive(Debug)]
struct PendingPush {
    report: Vec<u8>,
    offset: usize,
}

/// Client side of one notification link
#[derive(Debug)]
pub struct NotificationClient {
    peer: PeerAddress,
    instance: InstanceId,
    config: NotifyConfig,
    state: NotifyState,
    conn: Option<ConnId>,
    connection_id: Option<u32>,
    body_capacity: usize,
    push: Option<PendingPush>,
    serial: u64,
}

impl NotificationClient {
    /// Client for reports of `instance` to `peer`
    #[must_use]
    pub fn new(peer: PeerAddress, instance: InstanceId, config: NotifyConfig) -> Self {
        Self {
            peer,
            instance,
            config,
            state: NotifyState::Idle,
            conn: None,
            connection_id: None,
            body_capacity: 0,
            push: None,
            serial: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> NotifyState {
        self.state
    }

    /// Peer the reports go to
    #[must_use]
    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    /// Service instance the reports come from
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Link the transport opened for this client
    #[must_use]
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Send the Connect on a freshly opened link
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Busy` unless the client is idle.
    pub fn connect(&mut self, conn: ConnId, out: &mut Vec<ClientOutput>) -> Result<(), NotifyError> {
        if self.state != NotifyState::Idle {
            return Err(NotifyError::Busy);
        }
        self.conn = Some(conn);
        self.state = NotifyState::Connecting;
        tracing::debug!("notification client connecting to {}", self.peer);
        out.push(ClientOutput::Send(ClientRequest::Connect {
            max_packet_len: self.config.max_packet_len,
            headers: Headers {
                target: Some(TARGET_MESSAGE_NOTIFICATION.to_vec()),
                ..Headers::default()
            },
        }));
        self.arm(out);
        Ok(())
    }

    /// Push one event report object
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::NotConnected` before the link is up and
    /// `NotifyError::Busy` while another report is in flight.
    pub fn send_event(&mut self, report: Vec<u8>, out: &mut Vec<ClientOutput>) -> Result<(), NotifyError> {
        match self.state {
            NotifyState::Connected => {}
            NotifyState::Pushing | NotifyState::Connecting => return Err(NotifyError::Busy),
            NotifyState::Idle | NotifyState::Disconnecting => return Err(NotifyError::NotConnected),
        }
        self.state = NotifyState::Pushing;
        self.push = Some(PendingPush { report, offset: 0 });
        self.send_chunk(true, out);
        Ok(())
    }

    /// Close the link gracefully
    pub fn disconnect(&mut self, out: &mut Vec<ClientOutput>) {
        match self.state {
            NotifyState::Idle | NotifyState::Disconnecting => {}
            NotifyState::Connecting => self.fail(NotifyError::NotConnected, out),
            NotifyState::Connected | NotifyState::Pushing => {
                self.push = None;
                self.state = NotifyState::Disconnecting;
                out.push(ClientOutput::Send(ClientRequest::Disconnect {
                    headers: Headers {
                        connection_id: self.connection_id,
                        ..Headers::default()
                    },
                }));
                self.arm(out);
            }
        }
    }

    /// Response from the notification server
    pub fn on_response(
        &mut self,
        code: ResponseCode,
        headers: &Headers,
        max_packet_len: Option<u16>,
        out: &mut Vec<ClientOutput>,
    ) {
        self.serial += 1;
        match (self.state, code) {
            (NotifyState::Connecting, ResponseCode::Ok) => {
                let negotiated = max_packet_len
                    .unwrap_or(self.config.max_packet_len)
                    .min(self.config.max_packet_len);
                match body_capacity(negotiated) {
                    Ok(capacity) => {
                        self.body_capacity = capacity;
                        self.connection_id = headers.connection_id;
                        self.state = NotifyState::Connected;
                        tracing::info!("notification link to {} up", self.peer);
                        out.push(ClientOutput::Event(NotifyEvent::Connected));
                    }
                    Err(err) => {
                        tracing::warn!("notification server {}: {}", self.peer, err);
                        self.fail(NotifyError::Rejected(ResponseCode::BadRequest), out);
                    }
                }
            }
            (NotifyState::Pushing, ResponseCode::Continue) => self.send_chunk(false, out),
            (NotifyState::Pushing, ResponseCode::Ok) => {
                let bytes = self.push.take().map_or(0, |push| push.report.len());
                self.state = NotifyState::Connected;
                out.push(ClientOutput::Event(NotifyEvent::Delivered { bytes }));
            }
            (NotifyState::Disconnecting, _) => {
                self.reset();
                out.push(ClientOutput::Event(NotifyEvent::Disconnected));
            }
            (NotifyState::Idle | NotifyState::Connected, _) => {
                tracing::warn!("unsolicited {:?} from notification server", code);
            }
            (_, code) => {
                tracing::warn!("notification server {} answered {:?}", self.peer, code);
                self.fail(NotifyError::Rejected(code), out);
            }
        }
    }

    /// Response timer fired
    pub fn on_timeout(&mut self, serial: u64, out: &mut Vec<ClientOutput>) {
        if serial != self.serial || matches!(self.state, NotifyState::Idle | NotifyState::Connected) {
            return;
        }
        tracing::warn!("notification server {} did not answer", self.peer);
        self.fail(NotifyError::Timeout, out);
    }

    /// Transport dropped the link
    pub fn on_link_closed(&mut self, out: &mut Vec<ClientOutput>) {
        if self.state == NotifyState::Idle {
            return;
        }
        let was_closing = self.state == NotifyState::Disconnecting;
        self.reset();
        let event = if was_closing {
            NotifyEvent::Disconnected
        } else {
            NotifyEvent::Failed(NotifyError::NotConnected)
        };
        out.push(ClientOutput::Event(event));
    }

    fn send_chunk(&mut self, first: bool, out: &mut Vec<ClientOutput>) {
        let Some(push) = self.push.as_mut() else {
            return;
        };
        let mut buffer = TransferBuffer::new(self.body_capacity);
        let taken = buffer.fill_from(&push.report[push.offset..]);
        push.offset += taken;
        let final_bit = push.offset == push.report.len();

        let mut headers = Headers {
            connection_id: self.connection_id,
            body: Some(buffer.into_body()),
            end_of_body: final_bit,
            ..Headers::default()
        };
        if first {
            headers.object_type = Some(TYPE_EVENT_REPORT.to_string());
            headers.length = Some(push.report.len() as u64);
            headers.app_params = Some(AppParams {
                mas_instance_id: Some(self.instance.0),
                ..AppParams::default()
            });
        }
        out.push(ClientOutput::Send(ClientRequest::Put { headers, final_bit }));
        self.arm(out);
    }

    fn arm(&mut self, out: &mut Vec<ClientOutput>) {
        self.serial += 1;
        out.push(ClientOutput::ArmTimer {
            after: self.config.response_timeout,
            serial: self.serial,
        });
    }

    fn fail(&mut self, err: NotifyError, out: &mut Vec<ClientOutput>) {
        self.reset();
        out.push(ClientOutput::DropLink);
        out.push(ClientOutput::Event(NotifyEvent::Failed(err)));
    }

    fn reset(&mut self) {
        self.state = NotifyState::Idle;
        self.conn = None;
        self.connection_id = None;
        self.body_capacity = 0;
        self.push = None;
        self.serial += 1;
    }
}
