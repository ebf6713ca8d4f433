//! Reliable-session suspend and resume.
//!
//! Suspending serializes the connection parameters and the position of an
//! in-flight file transfer into a [`SuspendRecord`] and hands it to the
//! storage provider. A later Resume from the same peer loads the record,
//! reopens the object at the saved offset and continues where it stopped.
//!
//! If the client's next sequence number shows it never saw our last
//! response, the last chunk is replayed by seeking back one chunk.

use crate::callout::{Callout, CalloutOutput, CalloutResult, FileHandle, OpenMode};
use crate::error::ResumeError;
use crate::events::Outbox;
use crate::packet::{ConnId, Headers, PeerAddress, ReplyKind, ResponseCode, SessionControl};
use crate::session::{Release, Session};
use crate::transfer::{
    ActiveOp, GetObject, GetTransfer, OperationKind, PutObject, PutTransfer, Wait, Work,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted state of a suspended session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendRecord {
    /// Peer the session belongs to
    pub peer: PeerAddress,
    /// Sequence number of the last answered request
    pub ssn: u8,
    /// Negotiated packet length
    pub packet_len: u16,
    /// Current folder below the root
    pub folder: Vec<String>,
    /// File transfer in progress
    pub transfer: Option<SuspendedTransfer>,
}

/// Position of a suspended file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedTransfer {
    /// `GetFile` or `PutFile`
    pub operation: OperationKind,
    /// Object path
    pub path: PathBuf,
    /// Bytes already moved
    pub offset: u64,
    /// Size of the last chunk moved
    pub last_chunk: u64,
    /// Declared or reported object size
    pub total: Option<u64>,
}

impl SuspendRecord {
    /// Serialize for storage
    ///
    /// # Errors
    ///
    /// Returns `ResumeError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ResumeError> {
        bincode::serialize(self).map_err(|e| ResumeError::Encode(e.to_string()))
    }

    /// Deserialize a stored record
    ///
    /// # Errors
    ///
    /// Returns `ResumeError::Decode` for a corrupt blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, ResumeError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Scratch of a suspend waiting for the record to be saved
#[derive(Debug)]
pub(crate) struct SuspendWork {
    /// Transfer parked until the save completes
    pub suspended: Option<Box<ActiveOp>>,
}

/// Scratch of a resume in progress
#[derive(Debug)]
pub(crate) struct ResumeWork {
    /// Next sequence number announced by the client
    pub client_ssn: Option<u8>,
    /// Loaded record
    pub record: Option<SuspendRecord>,
    /// Reopened object
    pub handle: Option<FileHandle>,
    /// Offset the transfer continues at
    pub offset: u64,
    /// A corrective seek was issued
    pub seeking: bool,
}

impl Session {
    /// Capture the session state for a later resume
    fn suspend_record(&self, transfer: Option<&ActiveOp>) -> SuspendRecord {
        let transfer = transfer.and_then(|op| match &op.work {
            Work::Get(get) => match &get.object {
                GetObject::File(path) => Some(SuspendedTransfer {
                    operation: op.kind,
                    path: path.clone(),
                    offset: get.sent,
                    last_chunk: get.last_chunk,
                    total: get.total,
                }),
                GetObject::Message { .. } => None,
            },
            Work::Put(put) => match &put.object {
                PutObject::File(path) => Some(SuspendedTransfer {
                    operation: op.kind,
                    path: path.clone(),
                    offset: put.received,
                    last_chunk: put.last_chunk,
                    total: put.expected,
                }),
                PutObject::Message { .. } => None,
            },
            _ => None,
        });
        SuspendRecord {
            peer: self.peer().unwrap_or_default(),
            ssn: self.ssn,
            packet_len: self.packet_len(),
            folder: self.folder().to_vec(),
            transfer,
        }
    }

    pub(crate) fn suspend(&mut self, conn: ConnId, ssn: u8, out: &mut Outbox) {
        self.ssn = ssn;
        if self.op.as_ref().is_some_and(|op| !matches!(op.wait, Wait::Client)) {
            tracing::warn!("{} suspend while an operation step is pending", self.handle());
            out.reply(conn, ReplyKind::Session, ResponseCode::ServiceUnavailable, Headers::default());
            return;
        }

        let transfer = self.op.take();
        let record = self.suspend_record(transfer.as_ref());
        let blob = match record.encode() {
            Ok(blob) => blob,
            Err(err) => {
                tracing::error!("{} cannot suspend: {}", self.handle(), err);
                self.op = transfer;
                out.reply(conn, ReplyKind::Session, ResponseCode::InternalError, Headers::default());
                return;
            }
        };

        tracing::info!(
            "{} suspending ({} bytes of state)",
            self.handle(),
            blob.len()
        );
        let op = ActiveOp::new(
            OperationKind::Suspend,
            ReplyKind::Session,
            Work::Suspend(SuspendWork {
                suspended: transfer.map(Box::new),
            }),
        );
        let peer = record.peer;
        self.issue(op, Callout::SaveSession { peer, record: blob }, out);
    }

    pub(crate) fn suspend_step(&mut self, mut op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        let suspended = match &mut op.work {
            Work::Suspend(work) => work.suspended.take(),
            _ => None,
        };
        let conn = self.current_conn();

        match result {
            Ok(_) => {
                if let Some(transfer) = suspended {
                    self.release(*transfer, Release::Keep, out);
                }
                self.release(op, Release::Keep, out);
                out.reply(conn, ReplyKind::Session, ResponseCode::Ok, Headers::default());
                self.finish_close(out);
            }
            Err(err) => {
                tracing::warn!("{} suspend record not saved: {}", self.handle(), err);
                self.release(op, Release::Keep, out);
                if let Some(mut transfer) = suspended {
                    transfer.wait = Wait::Client;
                    self.op = Some(*transfer);
                }
                out.reply(conn, ReplyKind::Session, err.response_code(), Headers::default());
            }
        }
    }

    pub(crate) fn resume(
        &mut self,
        conn: ConnId,
        peer: PeerAddress,
        ssn: u8,
        control: SessionControl,
        out: &mut Outbox,
    ) {
        self.bind(conn, peer);
        self.ssn = ssn;
        tracing::info!("{} resume requested by {}", self.handle(), peer);
        let op = ActiveOp::new(
            OperationKind::Resume,
            ReplyKind::Session,
            Work::Resume(ResumeWork {
                client_ssn: control.next_ssn,
                record: None,
                handle: None,
                offset: 0,
                seeking: false,
            }),
        );
        self.issue(op, Callout::LoadSession { peer }, out);
    }

    pub(crate) fn resume_step(&mut self, mut op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        let result = match result {
            Ok(output) => output,
            Err(err) => {
                self.resume_failed(op, err.response_code(), &err.to_string(), out);
                return;
            }
        };
        let Work::Resume(work) = &mut op.work else {
            return;
        };

        match result {
            CalloutOutput::SessionRecord(blob) => {
                let record = match SuspendRecord::decode(&blob) {
                    Ok(record) if Some(record.peer) == self.peer() => record,
                    Ok(_) => {
                        let err = ResumeError::PeerMismatch;
                        self.resume_failed(op, ResponseCode::NotFound, &err.to_string(), out);
                        return;
                    }
                    Err(err) => {
                        self.resume_failed(op, ResponseCode::InternalError, &err.to_string(), out);
                        return;
                    }
                };
                if !self.restore_connection(record.packet_len, record.folder.clone()) {
                    self.resume_failed(op, ResponseCode::BadRequest, "packet length", out);
                    return;
                }

                let open = record.transfer.as_ref().map(|transfer| {
                    let mode = if transfer.operation == OperationKind::PutFile {
                        OpenMode::WriteAt(transfer.offset)
                    } else {
                        OpenMode::ReadAt(transfer.offset)
                    };
                    (transfer.path.clone(), mode, transfer.offset)
                });
                work.record = Some(record);
                match open {
                    Some((path, mode, offset)) => {
                        work.offset = offset;
                        self.issue(
                            op,
                            Callout::Open {
                                path,
                                mode,
                                size_hint: None,
                            },
                            out,
                        );
                    }
                    None => self.resume_complete(op, out),
                }
            }
            CalloutOutput::Opened { .. } => {
                let expected = work.record.as_ref().map(|r| r.ssn.wrapping_add(1));
                let last_chunk = work
                    .record
                    .as_ref()
                    .and_then(|r| r.transfer.as_ref())
                    .map_or(0, |t| t.last_chunk);
                let missed = work.client_ssn.is_some() && work.client_ssn != expected;
                match (missed, work.handle) {
                    (true, Some(handle)) if last_chunk > 0 => {
                        work.offset = work.offset.saturating_sub(last_chunk);
                        work.seeking = true;
                        tracing::debug!(
                            "{} client missed the last response, replaying from {}",
                            self.handle(),
                            work.offset
                        );
                        let offset = work.offset;
                        self.issue(op, Callout::Seek { handle, offset }, out);
                    }
                    _ => self.resume_complete(op, out),
                }
            }
            CalloutOutput::Done if work.seeking => self.resume_complete(op, out),
            other => {
                let detail = format!("unexpected completion {other:?}");
                self.resume_failed(op, ResponseCode::InternalError, &detail, out);
            }
        }
    }

    /// Rebuild the parked transfer and answer the resume
    fn resume_complete(&mut self, mut op: ActiveOp, out: &mut Outbox) {
        let Work::Resume(work) = &mut op.work else {
            return;
        };
        let handle = work.handle.take();
        let offset = work.offset;
        let record = work.record.take();
        self.release(op, Release::Keep, out);

        let transfer = record.as_ref().and_then(|r| r.transfer.clone());
        if let (Some(transfer), Some(handle)) = (transfer, handle) {
            let work = if transfer.operation == OperationKind::PutFile {
                Work::Put(PutTransfer {
                    object: PutObject::File(transfer.path),
                    handle: Some(handle),
                    message: None,
                    expected: transfer.total,
                    received: offset,
                    last_chunk: 0,
                    final_seen: false,
                    pending: Vec::new(),
                })
            } else {
                let mut get = GetTransfer::new(GetObject::File(transfer.path));
                get.handle = Some(handle);
                get.total = transfer.total;
                get.requested = offset;
                get.sent = offset;
                get.first = false;
                Work::Get(get)
            };
            let reply = if transfer.operation == OperationKind::PutFile {
                ReplyKind::Put
            } else {
                ReplyKind::Get
            };
            self.op = Some(ActiveOp::new(transfer.operation, reply, work));
        }

        let ssn = record.map(|r| r.ssn);
        out.reply(
            self.current_conn(),
            ReplyKind::Session,
            ResponseCode::Ok,
            Headers {
                session_ssn: ssn,
                ..Headers::default()
            },
        );
        self.announce(out);
        tracing::info!("{} resumed", self.handle());
    }

    fn resume_failed(&mut self, op: ActiveOp, code: ResponseCode, detail: &str, out: &mut Outbox) {
        tracing::warn!("{} resume failed: {}", self.handle(), detail);
        let conn = self.current_conn();
        self.release(op, Release::Keep, out);
        out.reply(conn, ReplyKind::Session, code, Headers::default());
        self.finish_close(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding() {
        let record = SuspendRecord {
            peer: PeerAddress([1, 2, 3, 4, 5, 6]),
            ssn: 9,
            packet_len: 0x400,
            folder: vec!["docs".into()],
            transfer: Some(SuspendedTransfer {
                operation: OperationKind::GetFile,
                path: PathBuf::from("/srv/docs/a.bin"),
                offset: 4096,
                last_chunk: 1000,
                total: Some(10_000),
            }),
        };
        let blob = record.encode().unwrap();
        assert_eq!(SuspendRecord::decode(&blob).unwrap(), record);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        assert!(matches!(
            SuspendRecord::decode(&[0xFF, 0x01]),
            Err(ResumeError::Decode(_))
        ));
    }
}
