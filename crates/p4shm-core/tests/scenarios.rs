//! Multi-rank scenarios
//!
//! Every rank runs in its own thread with its own `Process`, attached to a
//! segment created by the test, so the full path through queues, fragments
//! and data-movement threads is exercised.

use p4shm_core::header::MsgHeader;
use p4shm_core::{
    AckReq, AtomicOp, Config, CtValue, Datatype, EntryOptions, EntrySpec, EqHandle, Error, Event,
    EventKind, IoBuf, ListKind, MatchId, MdOptions, MdSpec, Ni, NiFail, NiKind, Process,
    ProcessId, Remote, Segment, StatusRegister,
};
use std::sync::Barrier;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TIMEOUT: Duration = Duration::from_secs(20);

fn unique_name(tag: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("/p4shm_test_{tag}_{ts}")
}

fn base_config(tag: &str, num_procs: u32) -> Config {
    Config::new()
        .with_shm_name(unique_name(tag))
        .with_num_procs(num_procs)
        .with_small_frags(256, 16)
        .with_large_frags(1024, 8)
        .with_frustration_threshold(64)
}

/// Honors `RUST_LOG` when set; repeated calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `body(rank, process, barrier)` on one thread per rank.
fn run_group<F>(config: Config, body: F)
where
    F: Fn(u32, &Process, &Barrier) + Sync,
{
    init_tracing();
    let _segment = Segment::create(&config).unwrap();
    let barrier = Barrier::new(config.num_procs as usize);
    std::thread::scope(|s| {
        for rank in 0..config.num_procs {
            let config = config.clone().with_rank(rank);
            let (body, barrier) = (&body, &barrier);
            s.spawn(move || {
                let process = Process::init(config).unwrap();
                body(rank, &process, barrier);
                barrier.wait();
                process.fini().unwrap();
            });
        }
    });
}

fn rank(r: u32) -> ProcessId {
    ProcessId::Logical { rank: r }
}

fn next(ni: &Ni, eq: EqHandle) -> Event {
    ni.eq_poll(eq, TIMEOUT).unwrap()
}

/// Next event of `kind`, skipping send, link and unlink notifications.
fn next_of(ni: &Ni, eq: EqHandle, kind: EventKind) -> Event {
    loop {
        let event = next(ni, eq);
        match event.kind {
            k if k == kind => return event,
            EventKind::Send | EventKind::Link | EventKind::AutoUnlink | EventKind::AutoFree => {
                continue
            }
            other => panic!("expected {kind:?}, got {other:?}"),
        }
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_put_into_use_once_entry() {
    run_group(base_config("put", 2), |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        match me {
            0 => {
                let payload = IoBuf::from_vec(vec![0xde, 0xad, 0xbe, 0xef]);
                let md = ni.md_bind(&MdSpec::new(payload).with_eq(eq)).unwrap();
                barrier.wait();
                ni.put(md, 0, 4, AckReq::Ack, &Remote::new(rank(1), 0).with_user_ptr(11))
                    .unwrap();
                let send = next(&ni, eq);
                assert_eq!(send.kind, EventKind::Send);
                let ack = next(&ni, eq);
                assert_eq!(ack.kind, EventKind::Ack);
                assert_eq!(ack.ni_fail, NiFail::Ok);
                assert_eq!(ack.mlength, 4);
                assert_eq!(ack.user_ptr, 11);
            }
            _ => {
                assert_eq!(ni.pt_alloc(0, Some(eq)).unwrap(), 0);
                let buf = IoBuf::new(4);
                let spec = EntrySpec::new(buf.clone())
                    .with_options(EntryOptions::OP_PUT | EntryOptions::USE_ONCE);
                ni.le_append(0, &spec, ListKind::Priority).unwrap();
                assert_eq!(next(&ni, eq).kind, EventKind::Link);
                barrier.wait();

                let put = next(&ni, eq);
                assert_eq!(put.kind, EventKind::Put);
                assert_eq!(put.initiator, rank(0));
                assert_eq!((put.rlength, put.mlength), (4, 4));
                assert_eq!(buf.to_vec(), vec![0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(next(&ni, eq).kind, EventKind::AutoUnlink);
            }
        }
    });
}

#[test]
fn test_unexpected_put_then_append() {
    run_group(base_config("unexpected", 2), |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        if me == 1 {
            ni.pt_alloc(0, Some(eq)).unwrap();
        }
        barrier.wait();
        match me {
            0 => {
                let md = ni
                    .md_bind(&MdSpec::new(IoBuf::from_vec(b"early bird".to_vec())).with_eq(eq))
                    .unwrap();
                ni.put(md, 0, 10, AckReq::Ack, &Remote::new(rank(1), 0)).unwrap();
                let ack = next_of(&ni, eq, EventKind::Ack);
                assert_eq!(ack.ni_fail, NiFail::Ok);
                barrier.wait();
            }
            _ => {
                barrier.wait();
                let buf = IoBuf::new(16);
                ni.le_append(0, &EntrySpec::new(buf.clone()), ListKind::Priority)
                    .unwrap();
                let put = next(&ni, eq);
                assert_eq!(put.kind, EventKind::Put);
                assert_eq!(put.mlength, 10);
                assert_eq!(&buf.to_vec()[..10], b"early bird");
                assert_eq!(next(&ni, eq).kind, EventKind::Link);
            }
        }
    });
}

#[test]
fn test_fragment_reassembly_sizes() {
    let config = base_config("reassembly", 2);
    let c = config.large_frag_size - MsgHeader::SIZE;
    let sizes = [0, 1, c - 1, c, c + 1, 2 * c, 2 * c + 1];

    run_group(config, |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(64).unwrap();
        match me {
            0 => {
                let ct = ni.ct_alloc().unwrap();
                let mds: Vec<_> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, &len)| {
                        let spec = MdSpec::new(IoBuf::from_vec(pattern(len, i as u8)))
                            .with_ct(ct)
                            .with_options(MdOptions::EVENT_CT_ACK);
                        ni.md_bind(&spec).unwrap()
                    })
                    .collect();
                barrier.wait();
                for (md, &len) in mds.iter().zip(&sizes) {
                    ni.put(*md, 0, len as u64, AckReq::Ack, &Remote::new(rank(1), 0))
                        .unwrap();
                }
                let done = ni.ct_wait(ct, sizes.len() as u64).unwrap();
                assert_eq!(done, CtValue::success(sizes.len() as u64));
            }
            _ => {
                ni.pt_alloc(0, Some(eq)).unwrap();
                let bufs: Vec<_> = sizes
                    .iter()
                    .map(|&len| {
                        let buf = IoBuf::new(len);
                        let spec = EntrySpec::new(buf.clone())
                            .with_options(EntryOptions::OP_PUT | EntryOptions::USE_ONCE);
                        ni.le_append(0, &spec, ListKind::Priority).unwrap();
                        buf
                    })
                    .collect();
                barrier.wait();
                for (i, (buf, &len)) in bufs.iter().zip(&sizes).enumerate() {
                    let put = next_of(&ni, eq, EventKind::Put);
                    assert_eq!(put.mlength, len as u64, "message {i}");
                    assert_eq!(buf.to_vec(), pattern(len, i as u8), "message {i}");
                }
            }
        }
    });
}

#[test]
fn test_ack_accounting() {
    run_group(base_config("acks", 2), |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        match me {
            0 => {
                let ct = ni.ct_alloc().unwrap();
                let spec = MdSpec::new(IoBuf::new(8))
                    .with_ct(ct)
                    .with_options(MdOptions::EVENT_CT_ACK);
                let md = ni.md_bind(&spec).unwrap();
                barrier.wait();
                ni.put(md, 0, 8, AckReq::NoAck, &Remote::new(rank(1), 0)).unwrap();
                ni.put(md, 0, 8, AckReq::Ack, &Remote::new(rank(1), 0)).unwrap();
                ni.put(md, 0, 8, AckReq::Ack, &Remote::new(rank(1), 1)).unwrap();
                assert_eq!(ni.ct_wait(ct, 2).unwrap(), CtValue::new(1, 1));
                ni.md_release(md).unwrap();
            }
            _ => {
                ni.pt_alloc(0, Some(eq)).unwrap();
                ni.pt_alloc(1, Some(eq)).unwrap();
                ni.pt_disable(1).unwrap();
                ni.le_append(0, &EntrySpec::new(IoBuf::new(8)), ListKind::Priority)
                    .unwrap();
                barrier.wait();
                assert_eq!(next_of(&ni, eq, EventKind::Put).mlength, 8);
                assert_eq!(next_of(&ni, eq, EventKind::Put).mlength, 8);
                let dropped = next_of(&ni, eq, EventKind::PtDisabled);
                assert_eq!(dropped.ni_fail, NiFail::PtDisabled);
                assert_eq!(ni.status(StatusRegister::DropCount), 1);
            }
        }
    });
}

#[test]
fn test_contended_use_once_entry() {
    run_group(base_config("contended", 3), |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        let once = EntryOptions::OP_PUT | EntryOptions::USE_ONCE;
        match me {
            0 => {
                ni.pt_alloc(0, Some(eq)).unwrap();
                let first = IoBuf::new(8);
                let spec = EntrySpec::new(first.clone()).with_options(once);
                ni.le_append(0, &spec, ListKind::Priority).unwrap();
                barrier.wait();

                let winner = next_of(&ni, eq, EventKind::Put);
                let ProcessId::Logical { rank: w } = winner.initiator else {
                    panic!("unexpected initiator {:?}", winner.initiator);
                };
                assert_eq!(first.to_vec(), vec![w as u8; 8]);
                // Both initiators hold their acks once this returns
                barrier.wait();

                // The loser was buffered; the next entry absorbs it
                let second = IoBuf::new(8);
                let spec = EntrySpec::new(second.clone()).with_options(once);
                ni.le_append(0, &spec, ListKind::Priority).unwrap();
                let late = next_of(&ni, eq, EventKind::Put);
                assert_eq!(late.initiator, rank(3 - w));
                assert_eq!(second.to_vec(), vec![(3 - w) as u8; 8]);
                assert_eq!(ni.status(StatusRegister::DropCount), 0);
                barrier.wait();
            }
            _ => {
                let ct = ni.ct_alloc().unwrap();
                let spec = MdSpec::new(IoBuf::from_vec(vec![me as u8; 8]))
                    .with_ct(ct)
                    .with_options(MdOptions::EVENT_CT_ACK);
                let md = ni.md_bind(&spec).unwrap();
                barrier.wait();
                ni.put(md, 0, 8, AckReq::Ack, &Remote::new(rank(0), 0)).unwrap();
                assert_eq!(ni.ct_wait(ct, 1).unwrap(), CtValue::success(1));
                barrier.wait();
                barrier.wait();
                assert_eq!(ni.ct_get(ct).unwrap(), CtValue::success(1));
            }
        }
    });
}

#[test]
fn test_back_to_back_multi_fragment_puts_into_persistent_entry() {
    let config = base_config("persistent", 3);
    let len = 2 * (config.large_frag_size - MsgHeader::SIZE) + 5;

    run_group(config, |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(32).unwrap();
        match me {
            0 => {
                ni.pt_alloc(0, Some(eq)).unwrap();
                let buf = IoBuf::new(3 * len);
                ni.le_append(0, &EntrySpec::new(buf.clone()), ListKind::Priority)
                    .unwrap();
                barrier.wait();

                for _ in 0..3 {
                    let put = next_of(&ni, eq, EventKind::Put);
                    assert_eq!((put.rlength, put.mlength), (len as u64, len as u64));
                }
                let contents = buf.to_vec();
                assert_eq!(&contents[..len], &pattern(len, 10)[..]);
                assert_eq!(&contents[len..2 * len], &pattern(len, 11)[..]);
                assert_eq!(&contents[2 * len..], &pattern(len, 20)[..]);
            }
            _ => {
                let ct = ni.ct_alloc().unwrap();
                let seeds: &[u8] = if me == 1 { &[10, 11] } else { &[20] };
                let mds: Vec<_> = seeds
                    .iter()
                    .map(|&seed| {
                        let spec = MdSpec::new(IoBuf::from_vec(pattern(len, seed)))
                            .with_ct(ct)
                            .with_options(MdOptions::EVENT_CT_ACK);
                        ni.md_bind(&spec).unwrap()
                    })
                    .collect();
                barrier.wait();
                for (md, &seed) in mds.iter().zip(seeds) {
                    let slot = match seed {
                        10 => 0,
                        11 => 1,
                        _ => 2,
                    };
                    let remote = Remote::new(rank(0), 0).with_offset((slot * len) as u64);
                    ni.put(*md, 0, len as u64, AckReq::Ack, &remote).unwrap();
                }
                let n = seeds.len() as u64;
                assert_eq!(ni.ct_wait(ct, n).unwrap(), CtValue::success(n));
            }
        }
    });
}

#[test]
fn test_get_small_and_multi_fragment() {
    let config = base_config("get", 2);
    let c = config.large_frag_size - MsgHeader::SIZE;
    let large = 2 * c + 7;

    run_group(config, |me, process, barrier| {
        let ni = process.ni_init(NiKind::MatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        match me {
            0 => {
                let small = IoBuf::new(8);
                let big = IoBuf::new(large);
                let small_md = ni.md_bind(&MdSpec::new(small.clone()).with_eq(eq)).unwrap();
                let big_md = ni.md_bind(&MdSpec::new(big.clone()).with_eq(eq)).unwrap();
                barrier.wait();

                let remote = Remote::new(rank(1), 3).with_match_bits(0x10).with_offset(8);
                ni.get(small_md, 0, 8, &remote).unwrap();
                let reply = next(&ni, eq);
                assert_eq!(reply.kind, EventKind::Reply);
                assert_eq!((reply.ni_fail, reply.mlength), (NiFail::Ok, 8));
                assert_eq!(small.to_vec(), b"over shm");

                ni.get(big_md, 0, large as u64, &Remote::new(rank(1), 3).with_match_bits(0x20))
                    .unwrap();
                let reply = next(&ni, eq);
                assert_eq!(reply.kind, EventKind::Reply);
                assert_eq!(reply.mlength, large as u64);
                assert_eq!(big.to_vec(), pattern(large, 5));
            }
            _ => {
                ni.pt_alloc(3, Some(eq)).unwrap();
                let text = EntrySpec::new(IoBuf::from_vec(b"portals over shm".to_vec()))
                    .with_options(EntryOptions::OP_GET)
                    .with_match(MatchId::Any, 0x10, 0);
                let bulk = EntrySpec::new(IoBuf::from_vec(pattern(large, 5)))
                    .with_options(EntryOptions::OP_GET)
                    .with_match(MatchId::Any, 0x20, 0);
                ni.me_append(3, &text, ListKind::Priority).unwrap();
                ni.me_append(3, &bulk, ListKind::Priority).unwrap();
                barrier.wait();
                assert_eq!(next_of(&ni, eq, EventKind::Get).mlength, 8);
                assert_eq!(next_of(&ni, eq, EventKind::Get).mlength, large as u64);
            }
        }
    });
}

#[test]
fn test_atomics_and_swap() {
    run_group(base_config("atomic", 2), |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        let target = IoBuf::new(16);
        match me {
            0 => {
                let operand = IoBuf::new(8);
                let result = IoBuf::new(8);
                let put_md = ni.md_bind(&MdSpec::new(operand.clone()).with_eq(eq)).unwrap();
                let get_md = ni.md_bind(&MdSpec::new(result.clone()).with_eq(eq)).unwrap();
                let value = |v: i64| v.to_ne_bytes();
                let read = |buf: &IoBuf| i64::from_ne_bytes(buf.to_vec().try_into().unwrap());
                barrier.wait();

                operand.write(0, &value(5)).unwrap();
                let remote = Remote::new(rank(1), 0);
                ni.atomic(put_md, 0, 8, AckReq::Ack, &remote, AtomicOp::Sum, Datatype::Int64)
                    .unwrap();
                let ack = next_of(&ni, eq, EventKind::Ack);
                assert_eq!(ack.atomic_op, Some(AtomicOp::Sum));

                operand.write(0, &value(30)).unwrap();
                let second = Remote::new(rank(1), 0).with_offset(8);
                ni.fetch_atomic(get_md, 0, put_md, 0, 8, &second, AtomicOp::Max, Datatype::Int64)
                    .unwrap();
                let reply = next(&ni, eq);
                assert_eq!((reply.kind, reply.ni_fail), (EventKind::Reply, NiFail::Ok));
                assert_eq!(read(&result), 20);

                operand.write(0, &value(100)).unwrap();
                ni.swap(
                    get_md,
                    0,
                    put_md,
                    0,
                    8,
                    &Remote::new(rank(1), 0),
                    &value(15),
                    AtomicOp::Cswap,
                    Datatype::Int64,
                )
                .unwrap();
                assert_eq!(next(&ni, eq).kind, EventKind::Reply);
                assert_eq!(read(&result), 15);
            }
            _ => {
                target.write(0, &10i64.to_ne_bytes()).unwrap();
                target.write(8, &20i64.to_ne_bytes()).unwrap();
                ni.pt_alloc(0, Some(eq)).unwrap();
                ni.le_append(0, &EntrySpec::new(target.clone()), ListKind::Priority)
                    .unwrap();
                barrier.wait();
                assert_eq!(next_of(&ni, eq, EventKind::Atomic).mlength, 8);
                assert_eq!(next_of(&ni, eq, EventKind::FetchAtomic).mlength, 8);
                assert_eq!(next_of(&ni, eq, EventKind::FetchAtomic).mlength, 8);
                let contents = target.to_vec();
                assert_eq!(i64::from_ne_bytes(contents[..8].try_into().unwrap()), 100);
                assert_eq!(i64::from_ne_bytes(contents[8..].try_into().unwrap()), 30);
            }
        }
    });
}

#[test]
fn test_triggered_operations() {
    run_group(base_config("triggered", 2), |me, process, barrier| {
        let ni = process.ni_init(NiKind::NonMatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(16).unwrap();
        match me {
            0 => {
                let trigger = ni.ct_alloc().unwrap();
                let chained = ni.ct_alloc().unwrap();
                let reset = ni.ct_alloc().unwrap();
                let md = ni
                    .md_bind(&MdSpec::new(IoBuf::from_vec(b"fired".to_vec())).with_eq(eq))
                    .unwrap();
                barrier.wait();

                ni.triggered_put(md, 0, 5, AckReq::Ack, &Remote::new(rank(1), 0), trigger, 2)
                    .unwrap();
                ni.triggered_ct_inc(chained, CtValue::success(5), trigger, 2).unwrap();
                ni.triggered_ct_set(reset, CtValue::new(7, 1), chained, 5).unwrap();

                ni.ct_inc(trigger, CtValue::success(1)).unwrap();
                assert!(matches!(
                    ni.ct_poll(chained, 1, Duration::from_millis(50)),
                    Err(Error::CtNoneReached)
                ));
                ni.ct_inc(trigger, CtValue::success(1)).unwrap();

                assert_eq!(ni.ct_wait(chained, 5).unwrap(), CtValue::success(5));
                assert_eq!(ni.ct_wait(reset, 8).unwrap(), CtValue::new(7, 1));
                assert_eq!(next_of(&ni, eq, EventKind::Ack).mlength, 5);
            }
            _ => {
                let buf = IoBuf::new(8);
                ni.pt_alloc(0, Some(eq)).unwrap();
                ni.le_append(0, &EntrySpec::new(buf.clone()), ListKind::Priority)
                    .unwrap();
                barrier.wait();
                assert_eq!(next_of(&ni, eq, EventKind::Put).mlength, 5);
                assert_eq!(&buf.to_vec()[..5], b"fired");
            }
        }
    });
}

#[test]
fn test_match_entries_and_overflow_list() {
    run_group(base_config("overflow", 2), |me, process, barrier| {
        let ni = process.ni_init(NiKind::MatchingLogical, None).unwrap();
        let eq = ni.eq_alloc(32).unwrap();
        match me {
            0 => {
                let ct = ni.ct_alloc().unwrap();
                let md = ni
                    .md_bind(
                        &MdSpec::new(IoBuf::from_vec(b"abcd".to_vec()))
                            .with_ct(ct)
                            .with_options(MdOptions::EVENT_CT_ACK),
                    )
                    .unwrap();
                barrier.wait();
                for bits in [1u64, 2] {
                    ni.put(md, 0, 4, AckReq::Ack, &Remote::new(rank(1), 0).with_match_bits(bits))
                        .unwrap();
                }
                assert_eq!(ni.ct_wait(ct, 2).unwrap(), CtValue::success(2));
                barrier.wait();
            }
            _ => {
                ni.pt_alloc(0, Some(eq)).unwrap();
                let exact = IoBuf::new(4);
                ni.me_append(
                    0,
                    &EntrySpec::new(exact.clone()).with_match(MatchId::Id(rank(0)), 1, 0),
                    ListKind::Priority,
                )
                .unwrap();
                let overflow = IoBuf::new(64);
                ni.me_append(
                    0,
                    &EntrySpec::new(overflow.clone()).with_match(MatchId::Any, 0, !0),
                    ListKind::Overflow,
                )
                .unwrap();
                barrier.wait();
                barrier.wait();

                assert_eq!(exact.to_vec(), b"abcd");
                assert_eq!(&overflow.to_vec()[..4], b"abcd");

                let late = IoBuf::new(4);
                let spec = EntrySpec::new(late.clone()).with_match(MatchId::Any, 2, 0);
                ni.me_append(0, &spec, ListKind::Priority).unwrap();
                let mut kinds = Vec::new();
                while let Ok(event) = ni.eq_get(eq) {
                    kinds.push(event.kind);
                }
                assert_eq!(
                    kinds,
                    vec![
                        EventKind::Link,
                        EventKind::Link,
                        EventKind::Put,
                        EventKind::Put,
                        EventKind::PutOverflow,
                        EventKind::Link,
                    ]
                );
                // The late entry only reports where the data already is
                assert_eq!(late.to_vec(), vec![0; 4]);
            }
        }
    });
}
