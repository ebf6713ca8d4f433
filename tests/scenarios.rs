//! End-to-end session scenarios against the in-memory store.
//!
//! Each test drives the engine through the harness exactly as a transport
//! and storage provider would, one event at a time.

use obex_core::packet::{
    ActionId, ActionRequest, AppParams, SessionControl, SessionOpcode, SetPathRequest,
    TYPE_FOLDER_LISTING, TYPE_MESSAGE, TYPE_MESSAGE_LISTING, TYPE_MESSAGE_STATUS,
    TYPE_MESSAGE_UPDATE, TYPE_NOTIFICATION_REGISTRATION,
};
use obex_core::{
    AppEvent, Callout, CalloutOutput, ConnId, EngineConfig, FileHandle, Headers, InstanceConfig,
    MessageEntry, MessageHandle, OperationKind, ReplyKind, Request, ResponseCode, SessionState,
    StorageError, TransportCommand,
};
use obex_integration_tests::fixtures::{AccessPolicy, Harness, MemStore, PEER};

const ROOT: &str = "/obex";

fn store() -> MemStore {
    MemStore::new(ROOT)
        .with_file("/obex/report.txt", b"0123456789")
        .with_dir("/obex/photos")
        .with_file("/obex/photos/beach.jpg", &[0xFF, 0xD8, 0xFF, 0xE0])
        .with_dir("/obex/empty")
}

fn connected(packet_len: u16) -> Harness {
    let mut h = Harness::ftp(store());
    let reply = h.connect(packet_len);
    assert_eq!(reply.code, ResponseCode::Ok);
    h
}

fn listing_request() -> Request {
    Request::Get {
        headers: Headers {
            object_type: Some(TYPE_FOLDER_LISTING.to_string()),
            ..Headers::default()
        },
        final_bit: true,
    }
}

/// Message access instance whose callouts the test completes by hand
fn message_access() -> Harness {
    let mut h = Harness::new(
        EngineConfig::default(),
        InstanceConfig::message_access(0, ROOT, 1),
        MemStore::new(ROOT),
    );
    assert_eq!(h.connect(0x400).code, ResponseCode::Ok);
    h.auto_complete = false;
    h
}

fn message(handle: &str, read: bool) -> MessageEntry {
    MessageEntry {
        handle: MessageHandle(handle.to_string()),
        subject: "Hello".into(),
        datetime: "20240105T093000".into(),
        sender: "Alice".into(),
        recipient: "Bob".into(),
        kind: "SMS_GSM".into(),
        size: 42,
        read,
    }
}

fn map_put(object_type: &str, name: Option<&str>, params: AppParams, body: &[u8]) -> Request {
    Request::Put {
        headers: Headers {
            name: name.map(str::to_string),
            object_type: Some(object_type.to_string()),
            app_params: Some(params),
            body: Some(body.to_vec()),
            end_of_body: true,
            ..Headers::default()
        },
        final_bit: true,
    }
}

// ============================================================================
// Connection
// ============================================================================

#[test]
fn test_connect_enters_connected() {
    let mut h = Harness::ftp(store());
    let reply = h.connect(0x400);

    assert_eq!(reply.kind, ReplyKind::Connect);
    assert_eq!(reply.code, ResponseCode::Ok);
    assert_eq!(reply.max_packet_len, Some(0x400));
    assert_eq!(reply.headers.connection_id, Some(h.session().connection_id()));
    assert_eq!(h.session().state(), SessionState::Connected);
    assert_eq!(h.engine.index().lookup(&PEER), Some(h.session_handle()));
    assert!(h.events.iter().any(|e| matches!(e, AppEvent::Opened { peer, .. } if *peer == PEER)));
}

#[test]
fn test_disconnect_returns_to_listening() {
    let mut h = connected(0x400);
    let replies = h.request(Request::Disconnect);

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind, ReplyKind::Disconnect);
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(h.session().is_listening());
    assert!(h.engine.index().is_empty());
    assert!(h.events.iter().any(|e| matches!(e, AppEvent::Closed { .. })));
}

#[test]
fn test_request_before_connect_is_refused() {
    let mut h = Harness::ftp(store());
    let replies = h.request(listing_request());
    assert_eq!(replies[0].code, ResponseCode::ServiceUnavailable);
    assert!(h.issued.is_empty());
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_get_splits_file_across_packets() {
    // 20-byte packets leave 4 bytes of body per response
    let mut h = connected(20);
    let replies = h.get(Headers::named("report.txt", None));

    let codes: Vec<ResponseCode> = replies.iter().map(|r| r.code).collect();
    assert_eq!(
        codes,
        vec![ResponseCode::Continue, ResponseCode::Continue, ResponseCode::Ok]
    );
    let sizes: Vec<usize> = replies.iter().map(|r| r.body().len()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let body: Vec<u8> = replies.iter().flat_map(|r| r.body().to_vec()).collect();
    assert_eq!(body, b"0123456789");
    assert_eq!(replies[0].headers.length, Some(10));
    assert_eq!(replies[1].headers.length, None);
    assert!(replies[2].headers.end_of_body);
    assert_eq!(h.progress_bytes(), 10);
    assert_eq!(h.store.open_handles(), 0);
}

#[test]
fn test_get_missing_file() {
    let mut h = connected(0x400);
    let replies = h.get(Headers::named("nothing.txt", None));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, ResponseCode::NotFound);
    assert_eq!(h.completed(), vec![(OperationKind::GetFile, ResponseCode::NotFound)]);
}

#[test]
fn test_get_rejects_traversal() {
    let mut h = connected(0x400);
    let replies = h.get(Headers::named("../etc/passwd", None));
    assert_eq!(replies[0].code, ResponseCode::BadRequest);
    assert!(h.issued.is_empty());
}

#[test]
fn test_put_then_get_round_trip() {
    let mut h = connected(64);
    let data: Vec<u8> = (0..=200u8).collect();

    let replies = h.put("upload.bin", &data, 48);
    assert_eq!(replies.last().map(|r| r.code), Some(ResponseCode::Ok));
    assert!(replies[..replies.len() - 1]
        .iter()
        .all(|r| r.code == ResponseCode::Continue));
    assert_eq!(h.store.file("/obex/upload.bin"), Some(&data[..]));

    let replies = h.get(Headers::named("upload.bin", None));
    let body: Vec<u8> = replies.iter().flat_map(|r| r.body().to_vec()).collect();
    assert_eq!(body, data);
    assert_eq!(h.store.open_handles(), 0);
}

#[test]
fn test_denied_put_issues_no_callout() {
    let mut h = connected(0x400);
    h.access = AccessPolicy::Deny;

    let replies = h.put("new.txt", b"hello", 100);

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind, ReplyKind::Put);
    assert_eq!(replies[0].code, ResponseCode::Unauthorized);
    assert!(h.issued.is_empty());
    assert!(!h.store.exists("/obex/new.txt"));
    assert_eq!(h.completed(), vec![(OperationKind::PutFile, ResponseCode::Unauthorized)]);
}

#[test]
fn test_access_request_describes_upload() {
    let mut h = connected(0x400);
    h.access = AccessPolicy::Manual;

    let replies = h.put("new.txt", b"hello", 100);
    assert!(replies.is_empty());

    let request = h.last_access_request().unwrap();
    assert_eq!(request.operation, OperationKind::PutFile);
    assert_eq!(request.peer, PEER);
    assert_eq!(request.size, Some(5));
    assert_eq!(request.path.as_deref(), Some(std::path::Path::new("/obex/new.txt")));

    h.answer_access(true);
    assert_eq!(h.replies.last().map(|r| r.code), Some(ResponseCode::Ok));
    assert_eq!(h.store.file("/obex/new.txt"), Some(&b"hello"[..]));
}

#[test]
fn test_access_timeout_answers_unavailable() {
    let mut h = connected(0x400);
    h.access = AccessPolicy::Manual;

    h.get(Headers::named("report.txt", None));
    assert_eq!(h.timers.len(), 1);
    h.fire_timers();

    assert_eq!(h.replies.last().map(|r| r.code), Some(ResponseCode::ServiceUnavailable));
    assert_eq!(h.session().operation(), None);
    assert!(h.issued.is_empty());

    // A late answer changes nothing
    h.answer_access(true);
    assert!(h.issued.is_empty());
}

#[test]
fn test_short_read_is_continued_on_next_packet() {
    let mut h = connected(0x400);
    h.auto_complete = false;

    h.request(Request::Get {
        headers: Headers::named("report.txt", None),
        final_bit: true,
    });
    h.serve_next();
    assert!(matches!(h.pending[0].callout, Callout::Read { max_len: 10, .. }));

    // The provider hands back less than asked without reaching the end
    h.complete_next(Ok(CalloutOutput::Data {
        bytes: b"012345".to_vec(),
        eof: false,
    }));
    let first = h.replies.last().cloned().unwrap();
    assert_eq!(first.code, ResponseCode::Continue);
    assert_eq!(first.body(), b"012345");
    assert_eq!(first.headers.length, Some(10));

    h.request(Request::Get {
        headers: Headers::default(),
        final_bit: true,
    });
    assert!(matches!(h.pending[0].callout, Callout::Read { max_len: 4, .. }));
    h.complete_next(Ok(CalloutOutput::Data {
        bytes: b"6789".to_vec(),
        eof: false,
    }));

    let last = h.replies.last().cloned().unwrap();
    assert_eq!(last.code, ResponseCode::Ok);
    assert_eq!(last.body(), b"6789");
    assert!(last.headers.end_of_body);
    assert_eq!(h.progress_bytes(), 10);
}

#[test]
fn test_local_close_answers_request_awaiting_access() {
    let mut h = connected(0x400);
    h.access = AccessPolicy::Manual;

    assert!(h.put("new.txt", b"hello", 100).is_empty());
    h.engine.close_session(PEER).unwrap();
    h.pump();

    let reply = h.replies.last().cloned().unwrap();
    assert_eq!(reply.kind, ReplyKind::Put);
    assert_eq!(reply.code, ResponseCode::ServiceUnavailable);
    assert!(h.commands.contains(&TransportCommand::Disconnect { conn: ConnId(1) }));
    assert!(h.session().is_listening());
    assert!(h.issued.is_empty());
    assert!(!h.store.exists("/obex/new.txt"));
}

#[test]
fn test_failed_write_removes_partial_upload() {
    let mut h = connected(0x400);
    h.auto_complete = false;

    h.request(Request::Put {
        headers: Headers {
            name: Some("big.bin".into()),
            body: Some(vec![1; 32]),
            ..Headers::default()
        },
        final_bit: false,
    });
    h.serve_next(); // open
    assert!(matches!(h.pending.front().map(|r| &r.callout), Some(Callout::Write { .. })));
    h.complete_next(Err(StorageError::StorageFull));

    assert_eq!(h.replies.last().map(|r| r.code), Some(ResponseCode::StorageFull));
    assert_eq!(h.issued_named("unlink"), 1);
    assert!(!h.store.exists("/obex/big.bin"));
    assert_eq!(h.store.open_handles(), 0);
}

// ============================================================================
// Listings
// ============================================================================

#[test]
fn test_folder_listing_contains_entries() {
    let mut h = connected(0x400);
    let replies = h.get(Headers {
        object_type: Some(TYPE_FOLDER_LISTING.to_string()),
        ..Headers::default()
    });
    assert_eq!(replies.last().map(|r| r.code), Some(ResponseCode::Ok));

    let body: Vec<u8> = replies.iter().flat_map(|r| r.body().to_vec()).collect();
    let xml = String::from_utf8(body).unwrap();
    assert!(xml.contains("report.txt"));
    assert!(xml.contains("photos"));
    assert!(xml.trim_end().ends_with("</folder-listing>"));
    // Listings are not gated
    assert!(h.last_access_request().is_none());
}

#[test]
fn test_listing_split_over_small_packets() {
    let mut h = connected(32);
    let replies = h.get(Headers {
        object_type: Some(TYPE_FOLDER_LISTING.to_string()),
        ..Headers::default()
    });

    assert!(replies.len() > 3);
    assert!(replies.iter().all(|r| r.body().len() <= 16));
    let body: Vec<u8> = replies.iter().flat_map(|r| r.body().to_vec()).collect();
    let xml = String::from_utf8(body).unwrap();
    assert!(xml.contains("beach.jpg") || xml.contains("photos"));
}

#[test]
fn test_abort_mid_listing_waits_for_completion() {
    let mut h = connected(0x400);
    h.auto_complete = false;

    assert!(h.request(listing_request()).is_empty());
    assert!(matches!(h.pending.front().map(|r| &r.callout), Some(Callout::Enumerate { .. })));
    let releases = h.session().releases();

    let replies = h.request(Request::Abort);
    assert!(replies.is_empty(), "abort must wait for the enumerate completion");
    assert!(h.session().pending_callout().is_some());

    h.serve_next();

    let aborts: Vec<_> = h.replies.iter().filter(|r| r.kind == ReplyKind::Abort).collect();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].code, ResponseCode::Ok);
    assert_eq!(h.session().releases(), releases + 1);
    assert_eq!(h.session().operation(), None);
    assert!(h.pending.is_empty());
    // No listing packet went out after the abort
    assert!(!h.replies.iter().any(|r| r.kind == ReplyKind::Get));

    // A later disconnect has nothing left to release
    h.request(Request::Disconnect);
    assert_eq!(h.session().releases(), releases + 1);
}

#[test]
fn test_abort_during_get_closes_handle() {
    let mut h = connected(20);
    let replies = h.request(Request::Get {
        headers: Headers::named("report.txt", None),
        final_bit: true,
    });
    assert_eq!(replies[0].code, ResponseCode::Continue);
    assert_eq!(h.store.open_handles(), 1);

    let replies = h.request(Request::Abort);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert_eq!(h.store.open_handles(), 0);
    // Aborted operations are not reported as complete
    assert!(h.completed().is_empty());
}

// ============================================================================
// Folder operations
// ============================================================================

#[test]
fn test_delete_non_empty_folder() {
    let mut h = connected(0x400);
    let replies = h.request(Request::Put {
        headers: Headers::named("photos", None),
        final_bit: true,
    });

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind, ReplyKind::Put);
    assert_eq!(replies[0].code, ResponseCode::PreconditionFailed);
    assert!(h.store.exists("/obex/photos/beach.jpg"));
}

#[test]
fn test_delete_file_and_empty_folder() {
    let mut h = connected(0x400);
    for name in ["report.txt", "empty"] {
        let replies = h.request(Request::Put {
            headers: Headers::named(name, None),
            final_bit: true,
        });
        assert_eq!(replies[0].code, ResponseCode::Ok, "deleting {name}");
    }
    assert!(!h.store.exists("/obex/report.txt"));
    assert!(!h.store.exists("/obex/empty"));
    assert_eq!(h.issued_named("unlink"), 1);
    assert_eq!(h.issued_named("rmdir"), 1);
}

#[test]
fn test_setpath_navigation() {
    let mut h = connected(0x400);

    let replies = h.request(Request::SetPath(SetPathRequest {
        name: Some("photos".into()),
        ..SetPathRequest::default()
    }));
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert_eq!(h.session().folder(), ["photos".to_string()]);

    let replies = h.get(Headers::named("beach.jpg", None));
    assert_eq!(replies.last().map(|r| r.code), Some(ResponseCode::Ok));

    let replies = h.request(Request::SetPath(SetPathRequest {
        backup: true,
        ..SetPathRequest::default()
    }));
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(h.session().folder().is_empty());

    // Backing up from the root fails
    let replies = h.request(Request::SetPath(SetPathRequest {
        backup: true,
        ..SetPathRequest::default()
    }));
    assert_eq!(replies[0].code, ResponseCode::NotFound);
}

#[test]
fn test_setpath_into_file_is_not_found() {
    let mut h = connected(0x400);
    let replies = h.request(Request::SetPath(SetPathRequest {
        name: Some("report.txt".into()),
        ..SetPathRequest::default()
    }));
    assert_eq!(replies[0].code, ResponseCode::NotFound);
    assert!(h.session().folder().is_empty());
}

#[test]
fn test_setpath_create_makes_folder() {
    let mut h = connected(0x400);
    let replies = h.request(Request::SetPath(SetPathRequest {
        name: Some("music".into()),
        create: true,
        ..SetPathRequest::default()
    }));

    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(h.store.exists("/obex/music"));
    assert_eq!(h.session().folder(), ["music".to_string()]);
    assert_eq!(h.last_access_request().map(|r| r.operation), Some(OperationKind::MakeDir));
}

#[test]
fn test_copy_and_move_actions() {
    let mut h = connected(0x400);

    let replies = h.request(Request::Action(ActionRequest {
        action: ActionId::Copy,
        name: "report.txt".into(),
        dest_name: Some("photos/report.txt".into()),
        permissions: None,
    }));
    assert_eq!(replies[0].kind, ReplyKind::Action);
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(h.store.exists("/obex/report.txt"));
    assert!(h.store.exists("/obex/photos/report.txt"));

    let replies = h.request(Request::Action(ActionRequest {
        action: ActionId::Move,
        name: "report.txt".into(),
        dest_name: Some("renamed.txt".into()),
        permissions: None,
    }));
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(!h.store.exists("/obex/report.txt"));
    assert_eq!(h.store.file("/obex/renamed.txt"), Some(&b"0123456789"[..]));

    // Destination taken
    let replies = h.request(Request::Action(ActionRequest {
        action: ActionId::Move,
        name: "renamed.txt".into(),
        dest_name: Some("photos/report.txt".into()),
        permissions: None,
    }));
    assert_eq!(replies[0].code, ResponseCode::Forbidden);
}

#[test]
fn test_action_without_destination_is_bad_request() {
    let mut h = connected(0x400);
    let replies = h.request(Request::Action(ActionRequest {
        action: ActionId::Copy,
        name: "report.txt".into(),
        dest_name: None,
        permissions: None,
    }));
    assert_eq!(replies[0].code, ResponseCode::BadRequest);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_disconnect_during_callout_defers_teardown() {
    let mut h = connected(0x400);
    h.auto_complete = false;

    h.request(Request::Get {
        headers: Headers::named("report.txt", None),
        final_bit: true,
    });
    let replies = h.request(Request::Disconnect);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert_eq!(h.session().state(), SessionState::Closing);

    // Requests are refused while closing
    let replies = h.request(listing_request());
    assert_eq!(replies[0].code, ResponseCode::ServiceUnavailable);

    h.serve_next();
    assert!(h.session().is_listening());
    assert_eq!(h.store.open_handles(), 0);
    assert!(h.events.iter().any(|e| matches!(e, AppEvent::Closed { .. })));
}

#[test]
fn test_link_loss_mid_upload_discards_partial() {
    let mut h = connected(64);
    let replies = h.request(Request::Put {
        headers: Headers {
            name: Some("partial.bin".into()),
            length: Some(1000),
            body: Some(vec![7; 40]),
            ..Headers::default()
        },
        final_bit: false,
    });
    assert_eq!(replies[0].code, ResponseCode::Continue);
    assert!(h.store.exists("/obex/partial.bin"));

    h.link_closed();
    assert!(h.session().is_listening());
    assert!(!h.store.exists("/obex/partial.bin"));
    assert_eq!(h.store.open_handles(), 0);
}

#[test]
fn test_disable_service_drains_sessions() {
    let mut h = connected(0x400);
    let instance = h.session().instance();
    h.engine.disable_service(instance).unwrap();
    h.pump();

    assert!(h.commands.contains(&TransportCommand::Disconnect { conn: ConnId(1) }));
    assert!(h.events.iter().any(|e| matches!(e, AppEvent::Disabled { .. })));
    assert!(h.engine.instances().is_empty());
}

// ============================================================================
// Suspend and resume
// ============================================================================

#[test]
fn test_suspend_and_resume_get() {
    let mut h = connected(20);
    let first = h.request(Request::Get {
        headers: Headers::named("report.txt", None),
        final_bit: true,
    });
    assert_eq!(first[0].body(), b"0123");

    let replies = h.request(Request::SessionControl(SessionControl {
        opcode: SessionOpcode::Suspend,
        next_ssn: None,
        timeout_secs: None,
    }));
    assert_eq!(replies[0].kind, ReplyKind::Session);
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(h.session().is_listening());
    assert_eq!(h.store.open_handles(), 0);

    // Suspend went out with sequence number 2; the client expects 3 next
    let replies = h.request(Request::SessionControl(SessionControl {
        opcode: SessionOpcode::Resume,
        next_ssn: Some(3),
        timeout_secs: None,
    }));
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert_eq!(replies[0].headers.session_ssn, Some(2));
    assert_eq!(h.session().state(), SessionState::Connected);
    assert_eq!(h.session().operation(), Some(OperationKind::GetFile));

    let rest = h.get(Headers::default());
    let body: Vec<u8> = rest.iter().flat_map(|r| r.body().to_vec()).collect();
    assert_eq!(body, b"456789");
    assert_eq!(rest.last().map(|r| r.code), Some(ResponseCode::Ok));
}

#[test]
fn test_resume_replays_chunk_the_client_missed() {
    let mut h = connected(20);
    let first = h.request(Request::Get {
        headers: Headers::named("report.txt", None),
        final_bit: true,
    });
    assert_eq!(first[0].body(), b"0123");
    h.request(Request::SessionControl(SessionControl {
        opcode: SessionOpcode::Suspend,
        next_ssn: None,
        timeout_secs: None,
    }));

    // The client never saw the response carrying "0123"
    let replies = h.request(Request::SessionControl(SessionControl {
        opcode: SessionOpcode::Resume,
        next_ssn: Some(2),
        timeout_secs: None,
    }));
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert_eq!(replies[0].headers.session_ssn, Some(2));
    assert_eq!(h.issued_named("seek"), 1);
    assert!(h
        .issued
        .iter()
        .any(|c| matches!(c, Callout::Seek { offset: 0, .. })));

    let rest = h.get(Headers::default());
    let body: Vec<u8> = rest.iter().flat_map(|r| r.body().to_vec()).collect();
    assert_eq!(body, b"0123456789");
    assert_eq!(rest.last().map(|r| r.code), Some(ResponseCode::Ok));
}

#[test]
fn test_resume_without_record_fails() {
    let mut h = Harness::ftp(store());
    let replies = h.request(Request::SessionControl(SessionControl {
        opcode: SessionOpcode::Resume,
        next_ssn: Some(1),
        timeout_secs: None,
    }));
    assert_eq!(replies[0].code, ResponseCode::NotFound);
    assert!(h.session().is_listening());
}

#[test]
fn test_stale_completion_after_abort_is_closed() {
    let mut h = connected(0x400);
    h.auto_complete = false;

    h.request(Request::Get {
        headers: Headers::named("report.txt", None),
        final_bit: true,
    });
    let stale = h.pending.pop_front().unwrap();
    h.request(Request::Abort);

    // The token is still live: this completes the open and answers the abort
    let opened = h.store.execute(&stale.callout);
    assert!(matches!(opened, Ok(CalloutOutput::Opened { .. })));
    h.engine.handle_completion(stale.complete(opened.clone()).unwrap());
    h.pump();
    assert_eq!(h.replies.last().map(|r| r.kind), Some(ReplyKind::Abort));
    assert_eq!(h.store.open_handles(), 0);

    // Replaying the same completion is stale and only closes the handle
    h.engine.handle_completion(stale.complete(opened).unwrap());
    h.pump();
    assert_eq!(h.issued_named("close"), 2);
    assert_eq!(h.replies.last().map(|r| r.kind), Some(ReplyKind::Abort));
}

// ============================================================================
// Message access
// ============================================================================

#[test]
fn test_push_message_returns_assigned_handle() {
    let mut h = message_access();
    let params = AppParams {
        charset: Some(1),
        ..AppParams::default()
    };
    h.request(map_put(TYPE_MESSAGE, Some("outbox"), params, b"BEGIN:BMSG"));

    assert!(matches!(
        &h.pending[0].callout,
        Callout::PushMessage { folder, charset: 1 } if folder.ends_with("outbox")
    ));
    h.complete_next(Ok(CalloutOutput::MessageCreated {
        handle: FileHandle(4),
        message: MessageHandle("20000100001".into()),
    }));
    assert!(matches!(&h.pending[0].callout, Callout::Write { data, .. } if data == b"BEGIN:BMSG"));
    h.complete_next(Ok(CalloutOutput::Written { len: 10 }));

    let reply = h.replies.last().cloned().unwrap();
    assert_eq!(reply.kind, ReplyKind::Put);
    assert_eq!(reply.code, ResponseCode::Ok);
    assert_eq!(reply.headers.name.as_deref(), Some("20000100001"));
    assert_eq!(h.issued_named("close"), 1);
    assert_eq!(h.completed(), vec![(OperationKind::PushMessage, ResponseCode::Ok)]);
}

#[test]
fn test_set_message_status() {
    let mut h = message_access();
    let params = AppParams {
        status_indicator: Some(0),
        status_value: Some(1),
        ..AppParams::default()
    };
    h.request(map_put(TYPE_MESSAGE_STATUS, Some("20000100001"), params, &[0x30]));

    assert_eq!(h.last_access_request().map(|r| r.operation), Some(OperationKind::SetMessageStatus));
    assert!(matches!(
        &h.pending[0].callout,
        Callout::SetMessageStatus { handle, value: true, .. } if handle.0 == "20000100001"
    ));
    h.complete_next(Ok(CalloutOutput::Done));
    assert_eq!(h.replies.last().map(|r| r.code), Some(ResponseCode::Ok));
    assert_eq!(h.completed(), vec![(OperationKind::SetMessageStatus, ResponseCode::Ok)]);
}

#[test]
fn test_update_inbox_needs_no_access() {
    let mut h = message_access();
    h.request(map_put(TYPE_MESSAGE_UPDATE, None, AppParams::default(), &[0x30]));

    assert!(h.last_access_request().is_none());
    assert_eq!(h.issued_named("update-inbox"), 1);
    h.complete_next(Ok(CalloutOutput::Done));
    assert_eq!(h.replies.last().map(|r| r.code), Some(ResponseCode::Ok));
}

#[test]
fn test_notification_registration_is_reported() {
    let mut h = message_access();
    let params = AppParams {
        notification_status: Some(true),
        ..AppParams::default()
    };
    let replies = h.request(map_put(TYPE_NOTIFICATION_REGISTRATION, None, params, &[0x30]));

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, ResponseCode::Ok);
    assert!(h.issued.is_empty());
    assert!(h.events.iter().any(|e| matches!(
        e,
        AppEvent::NotificationRegistration { peer, enabled: true, .. } if *peer == PEER
    )));
    assert_eq!(
        h.completed(),
        vec![(OperationKind::SetNotificationRegistration, ResponseCode::Ok)]
    );
}

#[test]
fn test_message_listing_count_only() {
    let mut h = message_access();
    h.request(Request::Get {
        headers: Headers {
            object_type: Some(TYPE_MESSAGE_LISTING.to_string()),
            app_params: Some(AppParams {
                max_list_count: Some(0),
                ..AppParams::default()
            }),
            ..Headers::default()
        },
        final_bit: true,
    });

    h.complete_next(Ok(CalloutOutput::Message(message("20000100001", true))));
    h.complete_next(Ok(CalloutOutput::Message(message("20000100002", false))));
    h.complete_next(Ok(CalloutOutput::EndOfEntries));

    assert_eq!(h.issued_named("message-list-next"), 3);
    let reply = h.replies.last().cloned().unwrap();
    assert_eq!(reply.code, ResponseCode::Ok);
    assert!(reply.body().is_empty());
    let params = reply.headers.app_params.unwrap();
    assert_eq!(params.listing_size, Some(2));
    assert_eq!(params.new_message, Some(true));
}
