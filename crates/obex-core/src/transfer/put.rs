//! Upload pipeline and MAP put-style requests.
//!
//! A PUT opens (creates) the object once, then writes each body chunk as it
//! arrives. The client's final packet only completes the operation after the
//! last write has itself completed; a failed write removes the partial file.

use super::{ActiveOp, MessageWork, OperationKind, PutObject, PutTransfer, Work};
use crate::callout::{Callout, CalloutOutput, CalloutResult, MessageHandle, StatusIndicator};
use crate::config::ObjectKind;
use crate::error::ProtocolError;
use crate::events::{AppEvent, Outbox};
use crate::packet::{
    Headers, ReplyKind, ResponseCode, TYPE_MESSAGE, TYPE_MESSAGE_STATUS, TYPE_MESSAGE_UPDATE,
    TYPE_NOTIFICATION_REGISTRATION,
};
use crate::session::{Release, Session};

impl Session {
    /// Handle one PUT packet
    pub(crate) fn on_put(
        &mut self,
        headers: Headers,
        final_bit: bool,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        if let Some(op) = self.op.take() {
            if matches!(op.work, Work::Put(_)) {
                self.continue_put(op, headers, final_bit, out);
                return Ok(());
            }
            self.op = Some(op);
            self.supersede(out);
        }

        // Headers may be spread over several packets before the body starts
        if headers.body.is_none() && !headers.end_of_body && !final_bit {
            self.hold_partial(ReplyKind::Put, headers, out);
            return Ok(());
        }
        let headers = self.complete_partial(ReplyKind::Put, headers);
        self.start_put(headers, final_bit, out)
    }

    fn start_put(&mut self, headers: Headers, final_bit: bool, out: &mut Outbox) -> Result<(), ProtocolError> {
        match headers.object_type.as_deref() {
            Some(TYPE_MESSAGE) => {
                self.require(ObjectKind::MessageUpdate, TYPE_MESSAGE)?;
                self.start_push_message(headers, final_bit, out)
            }
            Some(TYPE_MESSAGE_STATUS) => {
                self.require(ObjectKind::MessageUpdate, TYPE_MESSAGE_STATUS)?;
                self.start_message_status(&headers, out)
            }
            Some(TYPE_MESSAGE_UPDATE) => {
                self.require(ObjectKind::MessageUpdate, TYPE_MESSAGE_UPDATE)?;
                let op = ActiveOp::new(
                    OperationKind::UpdateInbox,
                    ReplyKind::Put,
                    Work::Message(MessageWork {
                        handle: None,
                        indicator: None,
                        value: false,
                    }),
                );
                self.gate(op, out);
                Ok(())
            }
            Some(TYPE_NOTIFICATION_REGISTRATION) => {
                self.require(ObjectKind::Notifications, TYPE_NOTIFICATION_REGISTRATION)?;
                self.register_notifications(&headers, out)
            }
            other if self.require(ObjectKind::Files, "file").is_ok() => {
                let name = headers
                    .name
                    .as_deref()
                    .ok_or(ProtocolError::MissingHeader("Name"))?;
                if headers.body.is_none() && !headers.end_of_body {
                    return self.start_delete(name, out);
                }
                if let Some(object_type) = other {
                    tracing::debug!("{} PUT {} as {}", self.handle(), name, object_type);
                }
                let path = self.child_path(name)?;
                let transfer = PutTransfer::new(PutObject::File(path), &headers, final_bit);
                let op = ActiveOp::new(OperationKind::PutFile, ReplyKind::Put, Work::Put(transfer));
                self.gate(op, out);
                Ok(())
            }
            other => Err(ProtocolError::UnsupportedType(other.map(str::to_string))),
        }
    }

    fn start_push_message(
        &mut self,
        headers: Headers,
        final_bit: bool,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        let folder = match headers.name.as_deref() {
            None | Some("") => self.folder_path(self.folder()),
            Some(name) => self.child_path(name)?,
        };
        let charset = headers
            .app_params
            .as_ref()
            .and_then(|params| params.charset)
            .ok_or(ProtocolError::MissingHeader("Charset"))?;
        let transfer = PutTransfer::new(PutObject::Message { folder, charset }, &headers, final_bit);
        let op = ActiveOp::new(OperationKind::PushMessage, ReplyKind::Put, Work::Put(transfer));
        self.gate(op, out);
        Ok(())
    }

    fn start_message_status(&mut self, headers: &Headers, out: &mut Outbox) -> Result<(), ProtocolError> {
        let handle = headers
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(ProtocolError::MissingHeader("Name"))?;
        let params = headers
            .app_params
            .as_ref()
            .ok_or(ProtocolError::MissingHeader("ApplicationParameters"))?;
        let indicator = match params.status_indicator {
            Some(0) => StatusIndicator::Read,
            Some(1) => StatusIndicator::Deleted,
            Some(_) => return Err(ProtocolError::NotAllowed("unknown status indicator")),
            None => return Err(ProtocolError::MissingHeader("StatusIndicator")),
        };
        let value = params
            .status_value
            .ok_or(ProtocolError::MissingHeader("StatusValue"))?
            != 0;

        let op = ActiveOp::new(
            OperationKind::SetMessageStatus,
            ReplyKind::Put,
            Work::Message(MessageWork {
                handle: Some(MessageHandle(handle.to_string())),
                indicator: Some(indicator),
                value,
            }),
        );
        self.gate(op, out);
        Ok(())
    }

    fn register_notifications(&mut self, headers: &Headers, out: &mut Outbox) -> Result<(), ProtocolError> {
        let enabled = headers
            .app_params
            .as_ref()
            .and_then(|params| params.notification_status)
            .ok_or(ProtocolError::MissingHeader("NotificationStatus"))?;
        let peer = self.peer().unwrap_or_default();
        tracing::info!(
            "{} notifications {} for {}",
            self.handle(),
            if enabled { "on" } else { "off" },
            peer
        );
        out.app(AppEvent::NotificationRegistration {
            session: self.handle(),
            instance: self.instance(),
            peer,
            enabled,
        });
        out.reply(self.current_conn(), ReplyKind::Put, ResponseCode::Ok, Headers::default());
        out.app(AppEvent::OperationComplete {
            session: self.handle(),
            operation: OperationKind::SetNotificationRegistration,
            code: ResponseCode::Ok,
            object: None,
        });
        Ok(())
    }

    fn continue_put(&mut self, mut op: ActiveOp, headers: Headers, final_bit: bool, out: &mut Outbox) {
        if let Work::Put(put) = &mut op.work {
            put.pending.extend_from_slice(headers.body_bytes());
            put.final_seen |= final_bit || headers.end_of_body;
        }
        self.flush_put(op, out);
    }

    /// Write what is pending, or answer the client
    fn flush_put(&mut self, mut op: ActiveOp, out: &mut Outbox) {
        let Work::Put(put) = &mut op.work else {
            return;
        };

        if !put.pending.is_empty() {
            let Some(handle) = put.handle else {
                tracing::error!("{} write without an open handle", self.handle());
                self.finish(op, ResponseCode::InternalError, Headers::default(), Release::Keep, out);
                return;
            };
            let data = std::mem::take(&mut put.pending);
            put.last_chunk = data.len() as u64;
            self.issue(op, Callout::Write { handle, data }, out);
            return;
        }

        if !put.final_seen {
            self.await_client(op, Headers::default(), out);
            return;
        }

        if let Some(expected) = put.expected {
            if expected != put.received {
                tracing::warn!(
                    "{} upload declared {} bytes but {} arrived",
                    self.handle(),
                    expected,
                    put.received
                );
            }
        }
        let headers = match &put.message {
            Some(message) => Headers {
                name: Some(message.to_string()),
                ..Headers::default()
            },
            None => Headers::default(),
        };
        self.finish(op, ResponseCode::Ok, headers, Release::Keep, out);
    }

    pub(crate) fn put_step(&mut self, mut op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        match result {
            Ok(CalloutOutput::Opened { .. } | CalloutOutput::MessageCreated { .. }) => {
                self.flush_put(op, out);
            }
            Ok(CalloutOutput::Written { len }) => {
                let session = self.handle();
                if let Work::Put(put) = &mut op.work {
                    if len as u64 != put.last_chunk {
                        tracing::warn!(
                            "{} short write: {} of {} bytes",
                            session,
                            len,
                            put.last_chunk
                        );
                    }
                    put.received += len as u64;
                    out.app(AppEvent::Progress {
                        session,
                        operation: op.kind,
                        bytes: len as u64,
                        total: put.expected,
                    });
                }
                self.flush_put(op, out);
            }
            Err(err) => self.fail(op, &err, Release::DiscardPartial, out),
            Ok(other) => {
                tracing::error!("{} unexpected completion during PUT: {:?}", self.handle(), other);
                self.finish(
                    op,
                    ResponseCode::InternalError,
                    Headers::default(),
                    Release::DiscardPartial,
                    out,
                );
            }
        }
    }
}

impl PutTransfer {
    fn new(object: PutObject, headers: &Headers, final_bit: bool) -> Self {
        Self {
            object,
            handle: None,
            message: None,
            expected: headers.length,
            received: 0,
            last_chunk: 0,
            final_seen: final_bit || headers.end_of_body,
            pending: headers.body_bytes().to_vec(),
        }
    }
}
