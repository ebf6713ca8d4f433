//! Folder and message listings.
//!
//! Entries are pulled from the provider one at a time and serialized into
//! the packet buffer. When an entry does not fit, the packet is sent with
//! what does and the rest is kept as `carry` for the start of the next one.

use super::{ActiveOp, ListingPhase, ListingSource, ListingTransfer, OperationKind, Work};
use crate::callout::{Callout, CalloutOutput, CalloutResult, ListingFilter};
use crate::error::ProtocolError;
use crate::events::Outbox;
use crate::packet::{AppParams, Headers, ReplyKind, ResponseCode, TransferBuffer};
use crate::session::{Release, Session};

impl Session {
    pub(crate) fn start_folder_listing(
        &mut self,
        name: Option<&str>,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        let (dir, at_root) = match name {
            None | Some("") => (self.folder_path(self.folder()), self.folder().is_empty()),
            Some(name) => (self.child_path(name)?, false),
        };
        let op = ActiveOp::new(
            OperationKind::ListFolder,
            ReplyKind::Get,
            Work::Listing(ListingTransfer::new(
                ListingSource::Folder { dir, at_root },
                false,
            )),
        );
        self.gate(op, out);
        Ok(())
    }

    pub(crate) fn start_message_listing(
        &mut self,
        headers: &Headers,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        let folder = match headers.name.as_deref() {
            None | Some("") => self.folder_path(self.folder()),
            Some(name) => self.child_path(name)?,
        };
        let params = headers.app_params.clone().unwrap_or_default();
        let count_only = params.max_list_count == Some(0);
        let filter = ListingFilter {
            max_count: params.max_list_count,
            start_offset: params.list_start_offset.unwrap_or(0),
            message_type: params.filter_message_type,
            read_status: params.filter_read_status,
            subject_length: params.subject_length,
        };
        let op = ActiveOp::new(
            OperationKind::GetMessageListing,
            ReplyKind::Get,
            Work::Listing(ListingTransfer::new(
                ListingSource::Messages { folder, filter },
                count_only,
            )),
        );
        self.gate(op, out);
        Ok(())
    }

    /// Serialize the preamble and start filling the first packet
    pub(crate) fn listing_start(&mut self, mut op: ActiveOp, out: &mut Outbox) {
        if let Work::Listing(listing) = &mut op.work {
            listing.carry = match (&listing.source, listing.count_only) {
                (_, true) => Vec::new(),
                (ListingSource::Folder { at_root, .. }, false) => self.renderer.folder_header(*at_root),
                (ListingSource::Messages { .. }, false) => self.renderer.message_header(),
            };
        }
        self.listing_fill(op, out);
    }

    /// Fill the current packet from carry, then from the provider
    pub(crate) fn listing_fill(&mut self, mut op: ActiveOp, out: &mut Outbox) {
        let capacity = self.body_capacity();
        let Work::Listing(listing) = &mut op.work else {
            return;
        };
        let mut buffer = listing
            .buffer
            .take()
            .unwrap_or_else(|| TransferBuffer::new(capacity));

        let taken = buffer.fill_from(&listing.carry);
        listing.carry.drain(..taken);

        if !listing.carry.is_empty() || (buffer.is_full() && listing.phase == ListingPhase::Entries) {
            listing.sent += buffer.offset() as u64;
            let headers = Headers {
                body: Some(buffer.into_body()),
                ..Headers::default()
            };
            self.await_client(op, headers, out);
            return;
        }

        if listing.phase == ListingPhase::Finished {
            listing.sent += buffer.offset() as u64;
            tracing::debug!(
                "{} listing done: {} entries, {} bytes",
                self.handle(),
                listing.entries,
                listing.sent
            );
            let headers = Headers {
                body: Some(buffer.into_body()),
                end_of_body: true,
                ..Headers::default()
            };
            self.finish(op, ResponseCode::Ok, headers, Release::Keep, out);
            return;
        }

        let reset = !listing.started;
        listing.started = true;
        let callout = match &listing.source {
            ListingSource::Folder { dir, .. } => Callout::Enumerate {
                dir: dir.clone(),
                reset,
            },
            ListingSource::Messages { folder, filter } => Callout::MessageListNext {
                folder: folder.clone(),
                reset,
                filter: filter.clone(),
            },
        };
        listing.buffer = Some(buffer);
        self.issue(op, callout, out);
    }

    pub(crate) fn listing_step(&mut self, mut op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        let Work::Listing(listing) = &mut op.work else {
            return;
        };
        match result {
            Err(err) => {
                self.fail(op, &err, Release::Keep, out);
                return;
            }
            Ok(CalloutOutput::Entry(entry)) => {
                if entry.name != "." && entry.name != ".." {
                    listing.entries += 1;
                    listing.carry.extend(self.renderer.folder_entry(&entry));
                }
            }
            Ok(CalloutOutput::Message(entry)) => {
                listing.entries += 1;
                if listing.count_only {
                    listing.new_message |= !entry.read;
                } else {
                    listing.carry.extend(self.renderer.message_entry(&entry));
                }
            }
            Ok(CalloutOutput::EndOfEntries) => {
                if listing.count_only {
                    let headers = Headers {
                        app_params: Some(AppParams {
                            listing_size: Some(u16::try_from(listing.entries).unwrap_or(u16::MAX)),
                            new_message: Some(listing.new_message),
                            ..AppParams::default()
                        }),
                        ..Headers::default()
                    };
                    self.finish(op, ResponseCode::Ok, headers, Release::Keep, out);
                    return;
                }
                let footer = match &listing.source {
                    ListingSource::Folder { .. } => self.renderer.folder_footer(),
                    ListingSource::Messages { .. } => self.renderer.message_footer(),
                };
                listing.carry.extend(footer);
                listing.phase = ListingPhase::Finished;
            }
            Ok(other) => {
                tracing::error!("{} unexpected completion during listing: {:?}", self.handle(), other);
                self.finish(op, ResponseCode::InternalError, Headers::default(), Release::Keep, out);
                return;
            }
        }
        self.listing_fill(op, out);
    }
}

impl ListingTransfer {
    fn new(source: ListingSource, count_only: bool) -> Self {
        Self {
            source,
            phase: ListingPhase::Entries,
            buffer: None,
            carry: Vec::new(),
            started: false,
            count_only,
            new_message: false,
            entries: 0,
            sent: 0,
        }
    }
}
