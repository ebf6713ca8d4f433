//! Download pipeline.
//!
//! A GET opens the object, then issues one read per response packet. Each
//! read asks for no more than the space left in the packet buffer (and no
//! more than the bytes still expected), so the provider can never overflow a
//! packet. The Length header rides on the first response only.

use super::{ActiveOp, GetObject, GetTransfer, OperationKind, Work};
use crate::callout::{Callout, CalloutOutput, CalloutResult, MessageHandle};
use crate::config::ObjectKind;
use crate::error::ProtocolError;
use crate::events::{AppEvent, Outbox};
use crate::packet::{
    Headers, ReplyKind, ResponseCode, TYPE_FOLDER_LISTING, TYPE_MESSAGE, TYPE_MESSAGE_LISTING,
    TransferBuffer,
};
use crate::registry::SessionHandle;
use crate::session::{Release, Session};

impl Session {
    /// Handle one GET packet
    pub(crate) fn on_get(
        &mut self,
        headers: Headers,
        final_bit: bool,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        if let Some(op) = self.op.take() {
            match &op.work {
                Work::Get(_) => {
                    self.read_next(op, out);
                    return Ok(());
                }
                Work::Listing(_) => {
                    self.listing_fill(op, out);
                    return Ok(());
                }
                _ => {
                    self.op = Some(op);
                    self.supersede(out);
                }
            }
        }

        if !final_bit {
            self.hold_partial(ReplyKind::Get, headers, out);
            return Ok(());
        }
        let headers = self.complete_partial(ReplyKind::Get, headers);
        self.start_get(headers, out)
    }

    fn start_get(&mut self, headers: Headers, out: &mut Outbox) -> Result<(), ProtocolError> {
        match headers.object_type.as_deref() {
            Some(TYPE_FOLDER_LISTING) => {
                self.require(ObjectKind::FolderListing, TYPE_FOLDER_LISTING)?;
                self.start_folder_listing(headers.name.as_deref(), out)
            }
            Some(TYPE_MESSAGE_LISTING) => {
                self.require(ObjectKind::MessageListing, TYPE_MESSAGE_LISTING)?;
                self.start_message_listing(&headers, out)
            }
            Some(TYPE_MESSAGE) => {
                self.require(ObjectKind::Messages, TYPE_MESSAGE)?;
                self.start_get_message(&headers, out)
            }
            other if self.require(ObjectKind::Files, "file").is_ok() => {
                let name = headers
                    .name
                    .as_deref()
                    .ok_or(ProtocolError::MissingHeader("Name"))?;
                if let Some(object_type) = other {
                    tracing::debug!("{} GET {} as {}", self.handle(), name, object_type);
                }
                self.start_get_file(name, out)
            }
            other => Err(ProtocolError::UnsupportedType(other.map(str::to_string))),
        }
    }

    fn start_get_file(&mut self, name: &str, out: &mut Outbox) -> Result<(), ProtocolError> {
        let path = self.child_path(name)?;
        let op = ActiveOp::new(
            OperationKind::GetFile,
            ReplyKind::Get,
            Work::Get(GetTransfer::new(GetObject::File(path))),
        );
        self.gate(op, out);
        Ok(())
    }

    fn start_get_message(&mut self, headers: &Headers, out: &mut Outbox) -> Result<(), ProtocolError> {
        let handle = headers
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(ProtocolError::MissingHeader("Name"))?;
        if !handle.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidName(handle.to_string()));
        }
        let params = headers.app_params.clone().unwrap_or_default();
        let object = GetObject::Message {
            handle: MessageHandle(handle.to_string()),
            charset: params.charset.unwrap_or(1),
            attachment: params.attachment.unwrap_or(false),
        };
        let op = ActiveOp::new(
            OperationKind::GetMessage,
            ReplyKind::Get,
            Work::Get(GetTransfer::new(object)),
        );
        self.gate(op, out);
        Ok(())
    }

    /// Issue the read for the next response packet
    pub(crate) fn read_next(&mut self, mut op: ActiveOp, out: &mut Outbox) {
        let capacity = self.body_capacity();
        let Work::Get(get) = &mut op.work else {
            return;
        };
        let Some(handle) = get.handle else {
            tracing::error!("{} read without an open handle", self.handle());
            self.finish(op, ResponseCode::InternalError, Headers::default(), Release::Keep, out);
            return;
        };

        let buffer = TransferBuffer::new(capacity);
        let mut max_len = buffer.bytes_left();
        if let Some(total) = get.total {
            let remaining = total.saturating_sub(get.sent);
            if remaining == 0 {
                // Empty object, or everything was delivered already
                get.check_length(self.handle());
                let headers = get.final_headers(buffer);
                self.finish(op, ResponseCode::Ok, headers, Release::Keep, out);
                return;
            }
            max_len = max_len.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        get.requested = get.sent + max_len as u64;
        get.buffer = Some(buffer);
        self.issue(op, Callout::Read { handle, max_len }, out);
    }

    pub(crate) fn get_step(&mut self, mut op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        match result {
            Err(err) => self.fail(op, &err, Release::Keep, out),
            Ok(CalloutOutput::Opened { size, .. }) => {
                if let Work::Get(get) = &mut op.work {
                    get.total = size;
                }
                self.read_next(op, out);
            }
            Ok(CalloutOutput::Data { bytes, eof }) => self.deliver(op, bytes, eof, out),
            Ok(other) => {
                tracing::error!("{} unexpected completion during GET: {:?}", self.handle(), other);
                self.finish(op, ResponseCode::InternalError, Headers::default(), Release::Keep, out);
            }
        }
    }

    fn deliver(&mut self, mut op: ActiveOp, bytes: Vec<u8>, eof: bool, out: &mut Outbox) {
        let session = self.handle();
        let capacity = self.body_capacity();
        let Work::Get(get) = &mut op.work else {
            return;
        };
        let mut buffer = get
            .buffer
            .take()
            .unwrap_or_else(|| TransferBuffer::new(capacity));

        if let Err(overflow) = buffer.push(&bytes) {
            tracing::error!(
                "{} provider returned {} bytes for {} bytes of space",
                session,
                overflow.offered,
                overflow.available
            );
            self.finish(op, ResponseCode::InternalError, Headers::default(), Release::Keep, out);
            return;
        }

        let len = bytes.len() as u64;
        get.sent += len;
        get.last_chunk = len;
        if !eof && get.sent < get.requested {
            tracing::debug!(
                "{} short read: {} of {} bytes",
                session,
                len,
                get.requested - (get.sent - len)
            );
            get.requested = get.sent;
        }
        out.app(AppEvent::Progress {
            session,
            operation: op.kind,
            bytes: len,
            total: get.total,
        });

        let done = eof || get.total.is_some_and(|total| get.sent >= total);
        if done {
            get.check_length(session);
            let headers = get.final_headers(buffer);
            self.finish(op, ResponseCode::Ok, headers, Release::Keep, out);
        } else {
            let headers = get.continue_headers(buffer);
            self.await_client(op, headers, out);
        }
    }
}

impl GetTransfer {
    pub(crate) fn new(object: GetObject) -> Self {
        Self {
            object,
            handle: None,
            total: None,
            requested: 0,
            sent: 0,
            last_chunk: 0,
            first: true,
            buffer: None,
        }
    }

    /// Warn when the bytes sent differ from the announced size
    fn check_length(&self, session: SessionHandle) {
        if let Some(total) = self.total {
            if total != self.sent {
                tracing::warn!(
                    "{} object announced {} bytes but {} were sent",
                    session,
                    total,
                    self.sent
                );
            }
        }
    }

    fn length_header(&mut self) -> Option<u64> {
        let length = if self.first { self.total } else { None };
        self.first = false;
        length
    }

    fn continue_headers(&mut self, buffer: TransferBuffer) -> Headers {
        Headers {
            length: self.length_header(),
            body: Some(buffer.into_body()),
            ..Headers::default()
        }
    }

    fn final_headers(&mut self, buffer: TransferBuffer) -> Headers {
        Headers {
            length: self.length_header(),
            body: Some(buffer.into_body()),
            end_of_body: true,
            ..Headers::default()
        }
    }
}
