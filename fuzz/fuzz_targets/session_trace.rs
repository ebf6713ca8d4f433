//! Fuzz test for the session engine
//!
//! Feeds an arbitrary interleaving of client requests, storage completions,
//! access answers and timer expiries into one engine. Nothing may panic and
//! no session may ever have two callouts outstanding.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use obex_core::packet::{ConnectRequest, SetPathRequest, TYPE_FOLDER_LISTING};
use obex_core::{
    AppEvent, CalloutOutput, ConnId, DirEntry, Engine, EngineConfig, FileHandle, Headers,
    InstanceConfig, InstanceId, Output, PeerAddress, Request, StorageError, StorageRequest,
    TransportEvent,
};
use std::collections::{HashMap, VecDeque};

const NAMES: [&str; 4] = ["a.txt", "photos", "..", "b c"];

#[derive(Debug, Arbitrary)]
enum Step {
    Connect { max_packet_len: u16 },
    Get { name: u8, listing: bool, final_bit: bool },
    Put { name: u8, body: Vec<u8>, final_bit: bool },
    SetPath { name: Option<u8>, backup: bool, create: bool },
    Abort,
    Disconnect,
    LinkClosed,
    Complete(Outcome),
    Access { allow: bool },
    Timer,
    CloseSession,
}

#[derive(Debug, Arbitrary)]
enum Outcome {
    Opened { size: Option<u16> },
    Data { len: u8, eof: bool },
    Written { len: u8 },
    Entry { dir: bool },
    End,
    Access { dir: bool },
    Done,
    Fail(u8),
}

fn name(i: u8) -> String {
    NAMES[usize::from(i) % NAMES.len()].to_string()
}

fuzz_target!(|steps: Vec<Step>| {
    let peer = PeerAddress([1, 2, 3, 4, 5, 6]);
    let mut engine = Engine::new(EngineConfig::default());
    if engine
        .enable_service(InstanceConfig::file_transfer("/fuzz"))
        .is_err()
    {
        return;
    }

    let mut pending: VecDeque<StorageRequest> = VecDeque::new();
    let mut timers = Vec::new();
    let mut access = None;

    for step in steps {
        let request = match step {
            Step::Connect { max_packet_len } => Some(Request::Connect(ConnectRequest {
                max_packet_len,
                headers: Headers {
                    target: Some(obex_core::packet::TARGET_FOLDER_BROWSING.to_vec()),
                    ..Headers::default()
                },
                auth: None,
            })),
            Step::Get { name: n, listing, final_bit } => Some(Request::Get {
                headers: if listing {
                    Headers::named(name(n), Some(TYPE_FOLDER_LISTING))
                } else {
                    Headers::named(name(n), None)
                },
                final_bit,
            }),
            Step::Put { name: n, body, final_bit } => Some(Request::Put {
                headers: Headers {
                    name: Some(name(n)),
                    end_of_body: final_bit && !body.is_empty(),
                    body: (!body.is_empty()).then_some(body),
                    ..Headers::default()
                },
                final_bit,
            }),
            Step::SetPath { name: n, backup, create } => Some(Request::SetPath(SetPathRequest {
                name: n.map(name),
                backup,
                create,
            })),
            Step::Abort => Some(Request::Abort),
            Step::Disconnect => Some(Request::Disconnect),
            Step::LinkClosed => Some(Request::LinkClosed),
            Step::Complete(outcome) => {
                if let Some(request) = pending.pop_front() {
                    let result = match outcome {
                        Outcome::Opened { size } => Ok(CalloutOutput::Opened {
                            handle: FileHandle(9),
                            size: size.map(u64::from),
                        }),
                        Outcome::Data { len, eof } => Ok(CalloutOutput::Data {
                            bytes: vec![0x5A; usize::from(len)],
                            eof,
                        }),
                        Outcome::Written { len } => Ok(CalloutOutput::Written {
                            len: usize::from(len),
                        }),
                        Outcome::Entry { dir } => Ok(CalloutOutput::Entry(DirEntry {
                            name: "entry".into(),
                            is_dir: dir,
                            size: 3,
                            modified: None,
                            user_perm: None,
                        })),
                        Outcome::End => Ok(CalloutOutput::EndOfEntries),
                        Outcome::Access { dir } => Ok(CalloutOutput::Access { is_dir: dir }),
                        Outcome::Done => Ok(CalloutOutput::Done),
                        Outcome::Fail(code) => Err(match code % 4 {
                            0 => StorageError::NotFound,
                            1 => StorageError::NotEmpty,
                            2 => StorageError::StorageFull,
                            _ => StorageError::Io("fuzz".into()),
                        }),
                    };
                    if let Some(completion) = request.complete(result) {
                        engine.handle_completion(completion);
                    }
                }
                None
            }
            Step::Access { allow } => {
                if let Some((session, operation)) = access.take() {
                    let _ = engine.access_response(session, operation, allow);
                }
                None
            }
            Step::Timer => {
                for event in timers.drain(..) {
                    engine.handle_timer(event);
                }
                None
            }
            Step::CloseSession => {
                let _ = engine.close_session(peer);
                None
            }
        };

        if let Some(request) = request {
            engine.handle_transport(TransportEvent {
                instance: InstanceId(0),
                conn: ConnId(1),
                peer,
                ssn: 0,
                request,
            });
        }

        for output in engine.drain() {
            match output {
                Output::Storage(request) if request.token.is_some() => pending.push_back(request),
                Output::Timer(timer) => timers.push(timer.event),
                Output::App(AppEvent::AccessRequested(request)) => {
                    access = Some((request.session, request.operation));
                }
                _ => {}
            }
        }

        let mut outstanding: HashMap<_, usize> = HashMap::new();
        for request in &pending {
            *outstanding.entry(request.session).or_default() += 1;
        }
        assert!(outstanding.values().all(|n| *n <= 1), "two callouts outstanding");
    }
});
