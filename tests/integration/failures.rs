use crate::*;

use lbsd::engine::slot::Phase;

const TIMEOUT: Duration = Duration::from_secs(41);

fn all_idle(net: &Harness) -> bool {
    net.engine.slots().iter().all(|s| s.phase == Phase::Idle)
}

fn no_reservations(net: &Harness) -> bool {
    (0..net.engine.registry().capacity())
        .filter_map(|i| net.engine.registry().entry_at(i))
        .all(|e| !e.reserved)
}

// ══════════════════════════════════════════════════════════════════════════════
//  Timeouts and retries
// ══════════════════════════════════════════════════════════════════════════════

/// A silent device gets the first message plus `max_retries` retransmissions,
/// then its slot and reserved address are released.
#[test]
fn test_retries_are_bounded() {
    for max_retries in [0u8, 1, 3] {
        let mut net = Harness::new(|c| c.bootstrap.max_retries = max_retries);
        let dev = net.device(1);
        net.deliver(&dev, &[]);

        let mut frames = 0;
        for _ in 0..10 {
            let sent = net.sent();
            frames += sent.len();
            for r in &sent {
                net.confirm(r);
            }
            net.advance(TIMEOUT);
        }
        assert_eq!(frames, 1 + max_retries as usize);
        assert!(all_idle(&net));
        assert!(no_reservations(&net));
        assert_eq!(net.engine.joined_count(), 0);
    }
}

/// A retransmission replays the same frame under a new handle.
#[test]
fn test_retransmission_reuses_frame() {
    let mut net = Harness::new(|c| c.bootstrap.max_retries = 2);
    let dev = net.device(1);
    net.deliver(&dev, &[]);
    let first = net.sent().remove(0);
    net.confirm(&first);
    net.advance(TIMEOUT);

    let retry = net.sent().remove(0);
    assert_eq!(retry.payload, first.payload);
    assert_ne!(retry.handle, first.handle);
    assert_eq!(net.engine.slots()[0].phase, Phase::WaitAck1);
    assert_eq!(net.engine.slots()[0].retries, 1);
}

/// Nothing happens before the deadline.
#[test]
fn test_no_retry_before_deadline() {
    let mut net = Harness::new(|_| {});
    let dev = net.device(1);
    net.deliver(&dev, &[]);
    let first = net.sent().remove(0);
    net.confirm(&first);
    net.advance(Duration::from_secs(39));
    assert!(net.link.is_empty());
    assert_eq!(net.engine.slots()[0].phase, Phase::WaitMsg2);
}

/// A device that answers the retransmitted message 1 still completes.
#[test]
fn test_join_completes_after_retry() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    net.deliver(&dev, &[]);
    let lost = net.sent().remove(0);
    net.confirm(&lost);
    net.advance(TIMEOUT);
    net.pump(&mut [&mut dev]);
    assert!(dev.accepted);
    assert_eq!(net.engine.joined_count(), 1);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Authentication failures
// ══════════════════════════════════════════════════════════════════════════════

/// A message 2 that does not echo RAND_S is rejected and nothing is committed.
#[test]
fn test_rand_mismatch_is_rejected() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    net.deliver(&dev, &[]);
    let m1 = net.sent().remove(0);
    net.confirm(&m1);

    let mut payload = eap_payload(&m1);
    payload[6] ^= 0xFF;
    let frame = lbp::decode(&m1.payload, Direction::ToDevice).unwrap();
    let tampered = LbpFrame {
        payload: &payload,
        ..frame
    };
    let m2 = dev.respond(&tampered).unwrap();
    net.deliver(&dev, &m2);

    assert!(net.link.is_empty());
    assert!(all_idle(&net));
    assert!(no_reservations(&net));
    assert_eq!(net.engine.joined_count(), 0);
}

/// A device with the wrong PSK fails MAC_P and is never given an address.
#[test]
fn test_wrong_psk_is_rejected() {
    let mut net = Harness::new(|_| {});
    let mut rogue = net.rogue(1);
    assert!(net.join(&mut rogue).is_err());
    assert_eq!(rogue.challenges, 1);
    assert!(rogue.address.is_none());
    assert!(all_idle(&net));
    assert!(no_reservations(&net));
}

/// An EAP message of the wrong number aborts the handshake.
#[test]
fn test_out_of_sequence_message_aborts() {
    let mut net = Harness::new(|_| {});
    let dev = net.device(1);
    net.deliver(&dev, &[]);
    let m1 = net.sent().remove(0);
    net.confirm(&m1);

    // A device never sends message 1; echo the coordinator's back at it.
    net.deliver(&dev, &eap_payload(&m1));
    assert!(all_idle(&net));
    assert!(no_reservations(&net));
}

/// Garbage inside a running handshake is dropped without disturbing it.
#[test]
fn test_malformed_eap_is_dropped() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    net.deliver(&dev, &[]);
    let m1 = net.sent().remove(0);
    net.confirm(&m1);

    net.deliver(&dev, &[0xFF, 0x00, 0x01]);
    assert_eq!(net.engine.slots()[0].phase, Phase::WaitMsg2);

    let frame = lbp::decode(&m1.payload, Direction::ToDevice).unwrap();
    let m2 = dev.respond(&frame).unwrap();
    net.deliver(&dev, &m2);
    net.pump(&mut [&mut dev]);
    assert!(dev.accepted);
}

/// Handshake payloads from a device with no session are dropped.
#[test]
fn test_stray_handshake_message_is_dropped() {
    let mut net = Harness::new(|_| {});
    let dev = net.device(1);
    net.deliver(&dev, &eap::encode_success(1));
    assert!(net.link.is_empty());
    assert!(all_idle(&net));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Link confirmations
// ══════════════════════════════════════════════════════════════════════════════

/// A failed confirmation for ACCEPTED leaves the device unregistered.
#[test]
fn test_failed_accept_confirmation_does_not_commit() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    net.deliver(&dev, &[]);

    for _ in 0..2 {
        let r = net.sent().remove(0);
        net.confirm(&r);
        let frame = lbp::decode(&r.payload, Direction::ToDevice).unwrap();
        let reply = dev.respond(&frame).unwrap();
        net.deliver(&dev, &reply);
    }
    let accepted = net.sent().remove(0);
    assert_eq!(kind_of(&accepted), MessageType::Accepted);
    net.confirm_with(&accepted, SendStatus::NoAck);

    assert_eq!(net.engine.joined_count(), 0);
    assert!(all_idle(&net));
    assert!(no_reservations(&net));
    assert!(net.events().is_empty());
}

/// A reply that overtakes the confirmation of the previous frame leaves that
/// confirmation pending on a secondary handle. Its failure is not fatal.
#[test]
fn test_secondary_handle_failure_is_ignored() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    net.deliver(&dev, &[]);
    let m1 = net.sent().remove(0);

    let frame = lbp::decode(&m1.payload, Direction::ToDevice).unwrap();
    let m2 = dev.respond(&frame).unwrap();
    net.deliver(&dev, &m2);
    assert_eq!(net.engine.slots()[0].phase, Phase::Sent3);
    assert_eq!(net.engine.slots()[0].pending, 2);

    net.confirm_with(&m1, SendStatus::ChannelAccessFailure);
    assert_eq!(net.engine.slots()[0].phase, Phase::Sent3);
    assert_eq!(net.engine.slots()[0].pending, 1);

    net.pump(&mut [&mut dev]);
    assert!(dev.accepted);
    assert_eq!(net.engine.joined_count(), 1);
}

/// Confirmations nobody is waiting for change nothing.
#[test]
fn test_unmatched_confirmation_is_discarded() {
    let mut net = Harness::new(|_| {});
    let dev = net.device(1);
    net.deliver(&dev, &[]);
    let m1 = net.sent().remove(0);
    net.engine.handle_confirmation(
        &Confirmation {
            handle: m1.handle.wrapping_add(50),
            status: SendStatus::NoAck,
        },
        net.now,
    );
    assert_eq!(net.engine.slots()[0].phase, Phase::Sent1);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Slot exhaustion
// ══════════════════════════════════════════════════════════════════════════════

/// With every slot busy a new JOINING is ignored, not declined.
#[test]
fn test_join_ignored_when_slots_full() {
    let mut net = Harness::new(|c| c.bootstrap.slots = 2);
    for n in 1..=3 {
        let d = net.device(n);
        net.deliver(&d, &[]);
    }
    let sent = net.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|r| kind_of(r) == MessageType::Challenge));
    assert_eq!(net.engine.registry().entry_at(2).map(|e| e.reserved), Some(false));
}

/// A blacklisted device is still declined when no slot is free; the decline
/// just is not tracked.
#[test]
fn test_decline_without_free_slot() {
    let mut net = Harness::new(|c| {
        c.bootstrap.slots = 1;
        c.security.blacklist = vec!["d000000000000002".into()];
    });
    let first = net.device(1);
    net.deliver(&first, &[]);
    net.sent();

    let banned = net.device(2);
    net.deliver(&banned, &[]);
    let sent = net.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(kind_of(&sent[0]), MessageType::Decline);
    assert_eq!(eap_payload(&sent[0])[0], EapCode::Failure as u8);
    assert_eq!(net.engine.slots()[0].identity, first.identity);
    assert_eq!(net.engine.slots()[0].phase, Phase::Sent1);
}
