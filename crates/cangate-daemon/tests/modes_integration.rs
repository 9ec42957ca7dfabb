//! Integration tests for the per-mode command handlers.
//!
//! # Purpose
//!
//! These tests exercise the BCM, ISO-TP and control modes end to end: a
//! session runs over an in-memory pipe, commands go in as the client would
//! send them, and the scripted bus records what reaches the wire.  They
//! verify:
//!
//! - BCM: one-shot and cyclic transmission, payload updates, job deletion,
//!   subscription filtering, and that jobs keep cycling while the client
//!   visits other modes.
//! - ISO-TP: single-frame and segmented transfers in both directions,
//!   including the generated and honored flow control frames.
//! - Control: the periodic `< stat ... >` stream, stopping it, and the
//!   no-bus error.
//!
//! # ISO-TP wire refresher
//!
//! ```text
//! single frame      0x0L  data            L = payload length, up to 7
//! first frame       0x1H  0xLL  data[0..6]  12-bit total length H·256+L
//! consecutive       0x2N  data            N = sequence number 1,2,...
//! flow control      0x30  BS    STmin     continue-to-send
//! ```

mod support;

use std::sync::Arc;
use std::time::Duration;

use cangate_core::{BusFrame, CanId};
use cangate_daemon::infrastructure::bus::mock::MockBusProvider;
use support::{spawn_session, wait_for_sent};

// ── BCM mode ──────────────────────────────────────────────────────────────────

/// Tests the BCM one-shot path: `< send >` transmits exactly one frame and
/// is acknowledged.
#[tokio::test]
async fn test_bcm_send_transmits_and_acknowledges() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< send 123 2 DE AD >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    // The acknowledgement follows the transmit, so no waiting is needed.
    let sent = bus.sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, CanId::Standard(0x123));
    assert_eq!(sent[0].data, vec![0xDE, 0xAD]);
}

/// Tests that `< add >` with a non-zero interval starts a cyclic job that
/// keeps transmitting the same frame.
#[tokio::test]
async fn test_bcm_add_starts_cyclic_transmission() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    // 20 ms interval.
    client.send("< add 0 20000 017 1 55 >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    let sent = wait_for_sent(&bus, 3).await;
    assert!(sent.iter().all(|f| f.id == CanId::Standard(0x17)));
    assert!(sent.iter().all(|f| f.data == vec![0x55]));
}

/// Tests that a zero-interval `< add >` degenerates into a single
/// transmission rather than a busy cyclic job.
#[tokio::test]
async fn test_bcm_zero_interval_add_is_one_shot() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< add 0 0 042 1 AA >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(bus.sent_frames().len(), 1, "one transmit, no repetition");
}

/// Tests that `< update >` swaps a running job's payload without touching
/// its timer: later cycles carry the new bytes.
#[tokio::test]
async fn test_bcm_update_swaps_cyclic_payload() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< add 0 20000 100 1 01 >").await;
    assert_eq!(client.next_reply().await, "< ok >");
    let before = wait_for_sent(&bus, 1).await;
    assert_eq!(before[0].data, vec![0x01]);

    client.send("< update 100 1 02 >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    // One cycle may already be in flight with the old payload; two more
    // guarantee a post-update transmit.
    let count = bus.sent_frames().len();
    let sent = wait_for_sent(&bus, count + 2).await;
    assert_eq!(
        sent.last().map(|f| f.data.clone()),
        Some(vec![0x02]),
        "cycles after the update must carry the new payload"
    );
}

/// Tests that `< update >` for an identifier with no job reports
/// `< error no such entry >`.
#[tokio::test]
async fn test_bcm_update_unknown_job_reports_no_such_entry() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< update 100 1 02 >").await;

    assert_eq!(client.next_reply().await, "< error no such entry >");
}

/// Tests that `< delete >` stops the cyclic job and that deleting it a
/// second time reports the miss.
#[tokio::test]
async fn test_bcm_delete_stops_the_job_and_reports_misses() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< add 0 10000 100 0 >").await;
    assert_eq!(client.next_reply().await, "< ok >");
    wait_for_sent(&bus, 2).await;

    client.send("< delete 100 >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    // Let any in-flight cycle land, then verify the count has settled.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let settled = bus.sent_frames().len();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(bus.sent_frames().len(), settled, "job must stop transmitting");

    client.send("< delete 100 >").await;
    assert_eq!(client.next_reply().await, "< error no such entry >");
}

/// Tests subscription filtering: only frames whose identifier was
/// subscribed are relayed to the client.
#[tokio::test]
async fn test_bcm_subscribe_filters_and_relays() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< subscribe 0 0 123 >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    // The unsubscribed identifier first; if filtering were broken it would
    // be the first relay the client sees.
    inject
        .send(BusFrame::new(CanId::Standard(0x124), vec![0x01]))
        .expect("inject frame");
    inject
        .send(BusFrame::new(CanId::Standard(0x123), vec![0x02]))
        .expect("inject frame");

    let reply = client.next_reply().await;
    assert!(
        reply.starts_with("< frame 123 "),
        "only the subscribed id may be relayed: {reply}"
    );
    assert!(reply.ends_with(" 02 >"), "unexpected payload: {reply}");
}

/// Tests that `< unsubscribe >` stops the relay and reports a miss for
/// identifiers that were never subscribed.
#[tokio::test]
async fn test_bcm_unsubscribe_stops_relay() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< subscribe 0 0 123 >").await;
    assert_eq!(client.next_reply().await, "< ok >");
    client.send("< unsubscribe 123 >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    inject
        .send(BusFrame::new(CanId::Standard(0x123), vec![0x01]))
        .expect("inject frame");

    // Nothing relayed: the next reply is the echo we ask for.
    client.send("< echo >").await;
    assert_eq!(client.next_reply().await, "< echo >");

    client.send("< unsubscribe 123 >").await;
    assert_eq!(client.next_reply().await, "< error no such entry >");
}

/// Tests that cyclic jobs keep transmitting while the client sits in a
/// different mode, and can be deleted after coming back.
#[tokio::test]
async fn test_bcm_jobs_keep_cycling_across_mode_switches() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< add 0 20000 100 1 33 >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    client.send("< rawmode >").await;
    let while_away = wait_for_sent(&bus, 3).await;
    assert!(while_away.iter().all(|f| f.data == vec![0x33]));

    client.send("< bcmmode >").await;
    client.send("< delete 100 >").await;
    assert_eq!(client.next_reply().await, "< ok >");
}

/// Tests that BCM commands other than `< echo >` need a bus: entering BCM
/// via the switch frame without `< open >` leaves every transmit rejected.
#[tokio::test]
async fn test_bcm_commands_without_bus_report_no_bus() {
    let provider = Arc::new(MockBusProvider::new());
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;

    client.send("< bcmmode >").await;
    client.send("< send 123 0 >").await;

    assert_eq!(client.next_reply().await, "< error no bus selected >");
}

// ── ISO-TP mode ───────────────────────────────────────────────────────────────

/// Tests the short-payload path: a PDU of up to seven bytes goes out as a
/// single frame on the configured transmit identifier.
#[tokio::test]
async fn test_isotp_single_frame_pdu_send() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    client.send("< sendpdu 0102 >").await;

    let sent = wait_for_sent(&bus, 1).await;
    assert_eq!(sent[0].id, CanId::Standard(0x712));
    assert_eq!(sent[0].data, vec![0x02, 0x01, 0x02], "SF: PCI 0x0L then payload");
}

/// Tests the segmented send path: the first frame goes out alone, the
/// consecutive frames only after the peer's flow control, and the
/// reassembled bytes equal the submitted PDU.
#[tokio::test]
async fn test_isotp_multi_frame_send_honors_flow_control() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    // 16 data bytes force FF + CF segmentation.
    let payload: Vec<u8> = (0u8..16).collect();
    client
        .send("< sendpdu 000102030405060708090A0B0C0D0E0F >")
        .await;

    // Only the first frame until flow control arrives.
    let first = wait_for_sent(&bus, 1).await;
    assert_eq!(first[0].data[0], 0x10, "FF PCI with high length nibble");
    assert_eq!(first[0].data[1], 16, "FF low length byte");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(bus.sent_frames().len(), 1, "CFs must wait for flow control");

    // Continue-to-send, no block limit, no separation time.
    inject
        .send(BusFrame::new(CanId::Standard(0x77A), vec![0x30, 0x00, 0x00]))
        .expect("inject flow control");

    let sent = wait_for_sent(&bus, 3).await;
    assert_eq!(sent[1].data[0], 0x21, "first CF sequence number");
    assert_eq!(sent[2].data[0], 0x22, "second CF sequence number");

    let mut rebuilt = sent[0].data[2..].to_vec();
    rebuilt.extend_from_slice(&sent[1].data[1..]);
    rebuilt.extend_from_slice(&sent[2].data[1..]);
    assert_eq!(rebuilt, payload, "reassembled CFs must equal the PDU");
}

/// Tests the receive side for a single frame: an SF on the receive
/// identifier is delivered as `< pdu hex >`.
#[tokio::test]
async fn test_isotp_receive_single_frame_delivers_pdu() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    inject
        .send(BusFrame::new(CanId::Standard(0x77A), vec![0x02, 0xAB, 0xCD]))
        .expect("inject single frame");

    assert_eq!(client.next_reply().await, "< pdu ABCD >");
}

/// Tests the receive side for a segmented transfer: the daemon answers the
/// first frame with flow control on the transmit identifier and delivers
/// the reassembled PDU once every consecutive frame arrived.
#[tokio::test]
async fn test_isotp_receive_multi_frame_sends_flow_control() {
    let provider = Arc::new(MockBusProvider::new());
    let (bus, inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    // 20-byte PDU: FF with 6 bytes, then 7 + 7 in consecutive frames.
    inject
        .send(BusFrame::new(
            CanId::Standard(0x77A),
            vec![0x10, 20, 0, 1, 2, 3, 4, 5],
        ))
        .expect("inject first frame");

    let fc = wait_for_sent(&bus, 1).await;
    assert_eq!(fc[0].id, CanId::Standard(0x712), "FC goes out on the tx id");
    assert_eq!(fc[0].data, vec![0x30, 0x00, 0x00], "continue-to-send FC");

    inject
        .send(BusFrame::new(
            CanId::Standard(0x77A),
            vec![0x21, 6, 7, 8, 9, 10, 11, 12],
        ))
        .expect("inject consecutive frame");
    inject
        .send(BusFrame::new(
            CanId::Standard(0x77A),
            vec![0x22, 13, 14, 15, 16, 17, 18, 19],
        ))
        .expect("inject consecutive frame");

    assert_eq!(
        client.next_reply().await,
        "< pdu 000102030405060708090A0B0C0D0E0F10111213 >"
    );
}

/// Tests that frames on identifiers other than the configured receive id
/// never reach the reassembler.
#[tokio::test]
async fn test_isotp_frames_on_other_ids_are_ignored() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    inject
        .send(BusFrame::new(CanId::Standard(0x100), vec![0x01, 0xFF]))
        .expect("inject frame on foreign id");
    inject
        .send(BusFrame::new(CanId::Standard(0x77A), vec![0x01, 0x42]))
        .expect("inject frame on rx id");

    assert_eq!(
        client.next_reply().await,
        "< pdu 42 >",
        "the foreign-id frame must not produce a PDU"
    );
}

/// Tests that `< sendpdu >` before `< config >` is rejected with the
/// channel error.
#[tokio::test]
async fn test_isotp_sendpdu_without_config_is_rejected() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< sendpdu 01 >").await;

    assert_eq!(client.next_reply().await, "< error no isotp channel >");
}

/// Tests that `< config >` works without a bus but `< sendpdu >` still
/// insists on one.
#[tokio::test]
async fn test_isotp_sendpdu_without_bus_is_rejected() {
    let provider = Arc::new(MockBusProvider::new());
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    client.send("< sendpdu 01 >").await;
    assert_eq!(client.next_reply().await, "< error no bus selected >");
}

/// Tests that an odd-length hex payload is rejected as bad parameters.
#[tokio::test]
async fn test_isotp_sendpdu_rejects_odd_hex() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< isotpmode >").await;
    client.send("< config 712 77A >").await;
    assert_eq!(client.next_reply().await, "< ok >");

    client.send("< sendpdu 012 >").await;
    assert_eq!(client.next_reply().await, "< error invalid parameters >");
}

// ── Control mode ──────────────────────────────────────────────────────────────

/// Tests the statistics stream: starting it yields an immediate
/// `< stat bus ... >` report with four numeric counters, and a zero
/// interval stops the stream.
#[tokio::test]
async fn test_control_statistics_stream_starts_and_stops() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< controlmode >").await;
    client.send("< statistics 250 >").await;

    let report = client.next_reply().await;
    let fields: Vec<&str> = report
        .trim_start_matches('<')
        .trim_end_matches('>')
        .split_whitespace()
        .collect();
    assert_eq!(fields.len(), 6, "stat line shape: {report}");
    assert_eq!(fields[0], "stat");
    assert_eq!(fields[1], "can0");
    for counter in &fields[2..] {
        counter
            .parse::<u64>()
            .unwrap_or_else(|_| panic!("counter '{counter}' in {report}"));
    }

    // Stop well before the next 250 ms tick, then verify nothing else is
    // queued ahead of the echo.
    client.send("< statistics 0 >").await;
    client.send("< echo >").await;
    assert_eq!(client.next_reply().await, "< echo >");
}

/// Tests that the statistics command without an opened bus reports the
/// no-bus error instead of streaming.
#[tokio::test]
async fn test_control_statistics_without_bus_reports_no_bus() {
    let provider = Arc::new(MockBusProvider::new());
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;

    client.send("< controlmode >").await;
    client.send("< statistics 100 >").await;

    assert_eq!(client.next_reply().await, "< error no bus selected >");
}

/// Tests that a non-numeric interval is rejected as bad parameters.
#[tokio::test]
async fn test_control_statistics_rejects_bad_interval() {
    let provider = Arc::new(MockBusProvider::new());
    let (_bus, _inject) = provider.add_bus("can0");
    let (mut client, _task) = spawn_session(provider);
    client.expect_greeting().await;
    client.open_bus("can0").await;

    client.send("< controlmode >").await;
    client.send("< statistics soon >").await;

    assert_eq!(client.next_reply().await, "< error invalid parameters >");
}
