use crate::*;

use lbsd::engine::{RekeyError, RekeyPhase};

fn joined(net: &mut Harness, count: u8) -> Vec<SimDevice> {
    let mut devs: Vec<SimDevice> = (1..=count).map(|n| net.device(n)).collect();
    for d in devs.iter_mut() {
        net.join(d).unwrap();
    }
    net.events();
    devs
}

// ══════════════════════════════════════════════════════════════════════════════
//  Group key rotation
// ══════════════════════════════════════════════════════════════════════════════

/// Every joined device receives the new key, then switches to it; only then
/// does the coordinator flip its own index.
#[test]
fn test_rekey_reaches_every_device() {
    let mut net = Harness::new(|_| {});
    let mut devs = joined(&mut net, 3);
    let old_index = net.engine.keys().current_index();
    let old_key = *net.engine.keys().current();

    net.engine.launch_rekey(net.now).unwrap();
    assert!(net.engine.is_rekeying());
    let pending = *net.engine.keys().pending().unwrap();
    assert_ne!(pending, old_key);

    let mut refs: Vec<&mut SimDevice> = devs.iter_mut().collect();
    let frames = net.pump(&mut refs);

    // Distribute frames for all devices strictly precede any activation.
    let kinds: Vec<_> = frames.iter().map(kind_of).collect();
    let first_accept = kinds.iter().position(|k| *k == MessageType::Accepted).unwrap();
    assert_eq!(first_accept, 6);
    assert!(kinds[first_accept..].iter().all(|k| *k == MessageType::Accepted));
    assert!(frames.iter().all(|f| f.security_enabled));

    assert!(!net.engine.is_rekeying());
    let new_index = net.engine.keys().current_index();
    assert_ne!(new_index, old_index);
    assert_eq!(*net.engine.keys().current(), pending);
    assert!(net.engine.keys().pending().is_none());
    for d in &devs {
        assert_eq!(d.active_key, Some(new_index));
        assert_eq!(d.active(), Some(pending));
        assert_eq!(d.keys[old_index as usize], Some(old_key));
    }
    assert_eq!(
        net.events(),
        vec![BootstrapEvent::RekeyCompleted {
            key_index: new_index
        }]
    );
}

/// Devices are rekeyed one at a time: only one slot is ever used.
#[test]
fn test_rekey_is_sequential() {
    let mut net = Harness::new(|_| {});
    let _devs = joined(&mut net, 3);
    net.engine.launch_rekey(net.now).unwrap();

    let sent = net.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].destination,
        LinkAddress::Short(ShortAddress(1))
    );
    let busy = net
        .engine
        .slots()
        .iter()
        .filter(|s| s.phase != lbsd::engine::slot::Phase::Idle)
        .count();
    assert_eq!(busy, 1);
    let progress = net.engine.rekey_progress().unwrap();
    assert_eq!(progress.phase, RekeyPhase::Distribute);
    assert_eq!(progress.total, 3);
}

#[test]
fn test_rekey_needs_devices_and_runs_once() {
    let mut net = Harness::new(|_| {});
    assert_eq!(net.engine.launch_rekey(net.now), Err(RekeyError::NoDevices));

    let _devs = joined(&mut net, 1);
    net.engine.launch_rekey(net.now).unwrap();
    assert_eq!(
        net.engine.launch_rekey(net.now),
        Err(RekeyError::AlreadyRunning)
    );
}

/// A device that never answers is skipped: it is not asked to activate a
/// key it does not have, and the others still complete.
#[test]
fn test_unresponsive_device_is_not_activated() {
    let mut net = Harness::new(|_| {});
    let mut devs = joined(&mut net, 3);
    let (left, rest) = devs.split_at_mut(1);
    let (silent, right) = rest.split_at_mut(1);
    let silent = &mut silent[0];
    let challenges_before = silent.challenges;

    net.engine.launch_rekey(net.now).unwrap();
    net.pump(&mut [&mut left[0], &mut right[0]]);
    assert!(net.engine.is_rekeying());

    // First timeout retransmits, second gives up.
    net.advance(Duration::from_secs(41));
    net.pump(&mut [&mut left[0], &mut right[0]]);
    net.advance(Duration::from_secs(41));
    net.pump(&mut [&mut left[0], &mut right[0]]);

    assert!(!net.engine.is_rekeying());
    let index = net.engine.keys().current_index();
    assert_eq!(left[0].active_key, Some(index));
    assert_eq!(right[0].active_key, Some(index));
    assert_ne!(silent.active_key, Some(index));
    assert_eq!(silent.challenges, challenges_before);
}

/// A device that leaves mid-rotation is dropped from it.
#[test]
fn test_departed_device_is_skipped() {
    let mut net = Harness::new(|_| {});
    let mut devs = joined(&mut net, 3);
    net.engine.launch_rekey(net.now).unwrap();
    net.engine.kick(ShortAddress(2), net.now).unwrap();

    let mut refs: Vec<&mut SimDevice> = devs.iter_mut().collect();
    net.pump(&mut refs);

    assert!(!net.engine.is_rekeying());
    let index = net.engine.keys().current_index();
    assert!(devs[1].kicked);
    assert_ne!(devs[1].active_key, Some(index));
    assert_eq!(devs[0].active_key, Some(index));
    assert_eq!(devs[2].active_key, Some(index));
}

/// Joins keep being served while a rotation is running.
#[test]
fn test_join_during_rekey() {
    let mut net = Harness::new(|c| c.bootstrap.slots = 2);
    let mut devs = joined(&mut net, 2);
    net.engine.launch_rekey(net.now).unwrap();

    let mut late = net.device(9);
    net.deliver(&late, &[]);
    let mut refs: Vec<&mut SimDevice> = devs.iter_mut().collect();
    refs.push(&mut late);
    net.pump(&mut refs);

    assert!(late.accepted);
    assert_eq!(net.engine.joined_count(), 3);
    assert!(!net.engine.is_rekeying());
    let current = *net.engine.keys().current();
    assert_eq!(late.active(), Some(current));
    for d in &devs {
        assert_eq!(d.active(), Some(current));
    }
}

/// A join whose message 3 went out before the rotation started is picked up
/// by the rotation once it lands.
#[test]
fn test_join_straddling_rekey_launch() {
    let mut net = Harness::new(|_| {});
    let mut devs = joined(&mut net, 2);

    let mut late = net.device(9);
    net.deliver(&late, &[]);
    let m1 = net.sent().remove(0);
    net.confirm(&m1);
    let frame = lbp::decode(&m1.payload, Direction::ToDevice).unwrap();
    let m2 = late.respond(&frame).unwrap();
    net.deliver(&late, &m2);

    net.engine.launch_rekey(net.now).unwrap();
    assert_eq!(net.engine.rekey_progress().unwrap().total, 3);

    let mut refs: Vec<&mut SimDevice> = devs.iter_mut().collect();
    refs.push(&mut late);
    net.pump(&mut refs);

    assert!(late.accepted);
    assert!(!net.engine.is_rekeying());
    let current = *net.engine.keys().current();
    assert_eq!(late.active(), Some(current));
    for d in &devs {
        assert_eq!(d.active(), Some(current));
    }
}

/// Key setters are refused while a rotation is in flight.
#[test]
fn test_keys_locked_during_rekey() {
    let mut net = Harness::new(|_| {});
    let _devs = joined(&mut net, 1);
    net.engine.launch_rekey(net.now).unwrap();
    let status = net
        .engine
        .set_param(lbsd::ParamAttribute::PendingGmk as u8, 0, &[1; 16]);
    assert_eq!(status, lbsd::ParamStatus::Failure);
}
