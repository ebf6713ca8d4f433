//! Property-based tests for the session engine
//!
//! Uses proptest to drive sessions through random request and completion
//! interleavings.

use obex_core::packet::TYPE_FOLDER_LISTING;
use obex_core::{Headers, OperationKind, ReplyKind, Request, ResponseCode};
use obex_integration_tests::fixtures::{AccessPolicy, Harness, MemStore};
use proptest::prelude::*;

const ROOT: &str = "/obex";

fn listing_request() -> Request {
    Request::Get {
        headers: Headers {
            object_type: Some(TYPE_FOLDER_LISTING.to_string()),
            ..Headers::default()
        },
        final_bit: true,
    }
}

fn store_with(entries: usize) -> MemStore {
    (0..entries).fold(
        MemStore::new(ROOT)
            .with_file("/obex/data.bin", &[0xAB; 300])
            .with_dir("/obex/full")
            .with_file("/obex/full/keep.txt", b"keep"),
        |store, i| store.with_file(format!("/obex/file{i:02}.txt"), b"x"),
    )
}

// ============================================================================
// Random session traces
// ============================================================================

/// One step of a client/provider trace
#[derive(Debug, Clone)]
enum Step {
    Connect,
    Get,
    List,
    Put(usize),
    Delete,
    Abort,
    Disconnect,
    LinkClosed,
    Serve,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        1 => Just(Step::Connect),
        2 => Just(Step::Get),
        2 => Just(Step::List),
        2 => (0usize..120).prop_map(Step::Put),
        1 => Just(Step::Delete),
        2 => Just(Step::Abort),
        1 => Just(Step::Disconnect),
        1 => Just(Step::LinkClosed),
        6 => Just(Step::Serve),
    ]
}

fn apply(h: &mut Harness, step: &Step) {
    match step {
        Step::Connect => {
            h.connect(64);
        }
        Step::Get => {
            h.request(Request::Get {
                headers: Headers::named("data.bin", None),
                final_bit: true,
            });
        }
        Step::List => {
            h.request(listing_request());
        }
        Step::Put(len) => {
            h.request(Request::Put {
                headers: Headers {
                    name: Some("upload.bin".into()),
                    body: Some(vec![1; *len]),
                    end_of_body: true,
                    ..Headers::default()
                },
                final_bit: true,
            });
        }
        Step::Delete => {
            h.request(Request::Put {
                headers: Headers::named("full", None),
                final_bit: true,
            });
        }
        Step::Abort => {
            h.request(Request::Abort);
        }
        Step::Disconnect => {
            h.request(Request::Disconnect);
        }
        Step::LinkClosed => h.link_closed(),
        Step::Serve => {
            if !h.pending.is_empty() {
                h.serve_next();
            }
        }
    }
}

proptest! {
    /// A session never has two callouts outstanding
    #[test]
    fn single_outstanding_callout(steps in prop::collection::vec(step(), 1..60)) {
        let mut h = Harness::ftp(store_with(3));
        h.auto_complete = false;
        for step in &steps {
            apply(&mut h, step);
            prop_assert!(h.peak_outstanding() <= 1, "after {:?}", step);
            prop_assert!(h.pending.len() <= 1);
        }
    }

    /// Handles are closed exactly once, whatever the interleaving
    #[test]
    fn no_double_release(steps in prop::collection::vec(step(), 1..60)) {
        let mut h = Harness::ftp(store_with(3));
        h.auto_complete = false;
        for step in &steps {
            apply(&mut h, step);
        }
        // Let everything settle, then drop the link
        while !h.pending.is_empty() {
            h.serve_next();
        }
        h.link_closed();
        while !h.pending.is_empty() {
            h.serve_next();
        }

        prop_assert_eq!(h.store.bad_closes(), 0);
        prop_assert_eq!(h.store.open_handles(), 0);
        prop_assert!(h.session().is_listening());
    }

    /// Every request that reaches a quiet engine has been answered
    #[test]
    fn every_request_answered(steps in prop::collection::vec(step(), 1..40)) {
        let mut h = Harness::ftp(store_with(2));
        for step in &steps {
            let before = h.replies.len();
            apply(&mut h, step);
            let silent = matches!(step, Step::LinkClosed | Step::Serve);
            if !silent {
                prop_assert!(h.replies.len() > before, "no reply to {:?}", step);
            }
        }
    }
}

// ============================================================================
// Transfer Properties
// ============================================================================

proptest! {
    /// Progress events add up to the declared size of a completed GET
    #[test]
    fn get_byte_accounting(size in 0usize..400, packet_len in 17u16..200) {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut h = Harness::ftp(MemStore::new(ROOT).with_file("/obex/blob.bin", &data));
        h.connect(packet_len);

        let replies = h.get(Headers::named("blob.bin", None));
        prop_assert_eq!(replies.last().map(|r| r.code), Some(ResponseCode::Ok));

        let capacity = usize::from(packet_len) - 16;
        prop_assert!(replies.iter().all(|r| r.body().len() <= capacity));
        let body: Vec<u8> = replies.iter().flat_map(|r| r.body().to_vec()).collect();
        prop_assert_eq!(body, data);
        prop_assert_eq!(h.progress_bytes(), size as u64);
    }

    /// An uploaded object arrives intact whatever the chunking
    #[test]
    fn put_preserves_bytes(size in 1usize..400, chunk in 1usize..64) {
        let data: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        let mut h = Harness::ftp(MemStore::new(ROOT));
        h.connect(0x400);

        let replies = h.put("blob.bin", &data, chunk);
        prop_assert_eq!(replies.last().map(|r| r.code), Some(ResponseCode::Ok));
        prop_assert_eq!(h.store.file("/obex/blob.bin"), Some(&data[..]));
        prop_assert_eq!(h.progress_bytes(), size as u64);
    }

    /// An access response naming the wrong operation changes nothing
    #[test]
    fn stale_access_response_ignored(started in 0usize..3, answered in 0usize..5) {
        const KINDS: [OperationKind; 5] = [
            OperationKind::GetFile,
            OperationKind::PutFile,
            OperationKind::Delete,
            OperationKind::Copy,
            OperationKind::GetMessage,
        ];
        prop_assume!(started != answered);

        let mut h = Harness::ftp(store_with(0));
        h.connect(0x400);
        h.access = AccessPolicy::Manual;

        let request = match KINDS[started] {
            OperationKind::GetFile => Request::Get {
                headers: Headers::named("data.bin", None),
                final_bit: true,
            },
            OperationKind::PutFile => Request::Put {
                headers: Headers {
                    name: Some("new.bin".into()),
                    body: Some(vec![0; 8]),
                    end_of_body: true,
                    ..Headers::default()
                },
                final_bit: true,
            },
            _ => Request::Put {
                headers: Headers::named("data.bin", None),
                final_bit: true,
            },
        };
        h.request(request);
        prop_assert_eq!(h.session().operation(), Some(KINDS[started]));

        let replies = h.replies.len();
        let issued = h.issued.len();
        let session = h.session_handle();
        h.engine.access_response(session, KINDS[answered], true).unwrap();
        h.pump();

        prop_assert_eq!(h.replies.len(), replies);
        prop_assert_eq!(h.issued.len(), issued);
        prop_assert_eq!(h.session().operation(), Some(KINDS[started]));
        prop_assert!(h.session().pending_access().is_some());
    }

    /// Abort while a listing callout is outstanding is answered only after
    /// the completion, and releases the listing once
    #[test]
    fn abort_deferred_until_completion(entries in 0usize..20, served in 0usize..20) {
        prop_assume!(served <= entries);
        let mut h = Harness::ftp(store_with(entries));
        h.connect(0x2000);
        h.auto_complete = false;

        h.request(listing_request());
        for _ in 0..served {
            h.serve_next();
        }
        prop_assert_eq!(h.pending.len(), 1);
        let releases = h.session().releases();

        let replies = h.request(Request::Abort);
        prop_assert!(replies.is_empty());

        h.serve_next();
        let aborts: Vec<_> = h.replies.iter().filter(|r| r.kind == ReplyKind::Abort).collect();
        prop_assert_eq!(aborts.len(), 1);
        prop_assert_eq!(aborts[0].code, ResponseCode::Ok);
        prop_assert_eq!(h.session().releases(), releases + 1);
        prop_assert!(h.pending.is_empty());
        prop_assert_eq!(h.session().operation(), None);
    }
}
