use crate::*;

use lbs_core::lbp::MessageType;
use lbsd::ParamAttribute;

// ══════════════════════════════════════════════════════════════════════════════
//  Joining
// ══════════════════════════════════════════════════════════════════════════════

/// Devices joining one after another get consecutive addresses from the base.
#[test]
fn test_sequential_joins_get_consecutive_addresses() {
    let mut net = Harness::new(|c| c.bootstrap.short_address_base = 0x10);
    let mut addresses = Vec::new();
    for n in 1..=4 {
        let mut dev = net.device(n);
        addresses.push(net.join(&mut dev).unwrap());
    }
    assert_eq!(
        addresses,
        (0x10..0x14).map(ShortAddress).collect::<Vec<_>>()
    );
    assert_eq!(net.engine.joined_count(), 4);
}

/// Joins that overlap in time each hold their own slot and end up with
/// distinct addresses.
#[test]
fn test_concurrent_joins_are_isolated() {
    let mut net = Harness::new(|c| c.bootstrap.slots = 3);
    let mut devs: Vec<SimDevice> = (1..=3).map(|n| net.device(n)).collect();
    for d in &devs {
        net.deliver(d, &[]);
    }

    let busy: Vec<_> = net
        .engine
        .slots()
        .into_iter()
        .filter(|s| s.phase != lbsd::engine::slot::Phase::Idle)
        .collect();
    assert_eq!(busy.len(), 3);
    for (i, a) in busy.iter().enumerate() {
        for b in &busy[i + 1..] {
            assert_ne!(a.identity, b.identity);
            assert_ne!(a.address, b.address);
        }
    }

    let mut refs: Vec<&mut SimDevice> = devs.iter_mut().collect();
    net.pump(&mut refs);

    let mut addresses: Vec<_> = devs.iter().map(|d| d.address.unwrap()).collect();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 3);
    for d in &devs {
        assert!(d.accepted);
        assert_eq!(net.engine.short_address(d.identity), d.address);
    }
}

/// A repeated empty JOINING while a handshake is running does not restart it.
#[test]
fn test_duplicate_first_join_is_ignored() {
    let mut net = Harness::new(|_| {});
    let dev = net.device(1);
    net.deliver(&dev, &[]);
    net.deliver(&dev, &[]);
    let sent = net.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(kind_of(&sent[0]), MessageType::Challenge);
    assert_eq!(
        net.engine
            .slots()
            .iter()
            .filter(|s| s.identity == dev.identity)
            .count(),
        1
    );
}

/// A device that joins again keeps the address it already holds.
#[test]
fn test_rejoin_keeps_address() {
    let mut net = Harness::new(|_| {});
    let mut first = net.device(1);
    let mut second = net.device(2);
    let a1 = net.join(&mut first).unwrap();
    net.join(&mut second).unwrap();

    let mut again = net.device(1);
    assert_eq!(net.join(&mut again).unwrap(), a1);
    assert_eq!(net.engine.joined_count(), 2);
}

/// Hop count: 1 for a direct neighbour, relay + 1 behind a relay.
#[test]
fn test_hop_count_follows_relay() {
    let mut net = Harness::new(|_| {});
    let mut near = net.device(1);
    let relay = net.join(&mut near).unwrap();

    let mut far = net.device(2).via(relay);
    let far_addr = net.join(&mut far).unwrap();

    let mut farther = net.device(3).via(far_addr);
    let farther_addr = net.join(&mut farther).unwrap();

    let hops = |a| net.engine.registry().lookup_by_address(a).unwrap().hop_count;
    assert_eq!(hops(relay), 1);
    assert_eq!(hops(far_addr), 2);
    assert_eq!(hops(farther_addr), 3);
}

/// First contact is routed without link security, with route discovery and
/// the link's hop limit. Frames to the device go back where the join came
/// from.
#[test]
fn test_join_frames_route_to_source() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1).via(ShortAddress(0x40));
    net.deliver(&dev, &[]);
    let frames = net.pump(&mut [&mut dev]);
    assert!(dev.accepted);
    assert_eq!(frames.len(), 3);
    for f in &frames {
        assert_eq!(f.destination, LinkAddress::Short(ShortAddress(0x40)));
        assert!(!f.security_enabled);
        assert!(f.discover_route);
        assert_eq!(f.max_hops, MAX_HOPS);
    }
    assert_eq!(
        frames.iter().map(kind_of).collect::<Vec<_>>(),
        vec![MessageType::Challenge, MessageType::Challenge, MessageType::Accepted]
    );
}

/// Joining hands the device the current group key and its index.
#[test]
fn test_join_delivers_current_group_key() {
    let mut net = Harness::new(|c| {
        c.security.gmk = "000102030405060708090a0b0c0d0e0f".into();
    });
    let mut dev = net.device(1);
    net.join(&mut dev).unwrap();
    let expected: [u8; 16] = core::array::from_fn(|i| i as u8);
    assert_eq!(dev.active(), Some(expected));
    assert_eq!(dev.active_key, Some(net.engine.keys().current_index()));
}

/// Derived mode: the address is the low 15 bits of the identity.
#[test]
fn test_derived_addresses() {
    let mut net = Harness::new(|c| c.bootstrap.derived_addresses = true);
    let mut dev = SimDevice::new(
        &lbs_core::crypto::Psk::new(*net.engine.keys().psk().as_bytes()),
        DeviceIdentity::new([0xD0, 0, 0, 0, 0, 0, 0x92, 0x34]),
    );
    assert_eq!(net.join(&mut dev).unwrap(), ShortAddress(0x1234));
    assert_eq!(net.engine.extended_address(ShortAddress(0x1234)), Some(dev.identity));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Blacklist and pool limits
// ══════════════════════════════════════════════════════════════════════════════

/// A blacklisted device is declined even when slots and addresses are free.
#[test]
fn test_blacklist_takes_precedence() {
    let mut net = Harness::new(|c| {
        c.security.blacklist = vec!["d000000000000002".into()];
    });
    let mut good = net.device(1);
    let mut banned = net.device(2);

    assert!(net.join(&mut banned).is_err());
    assert!(banned.declined);
    assert_eq!(banned.challenges, 0);
    assert_eq!(net.engine.joined_count(), 0);

    // Blacklisting at runtime applies to the next attempt.
    net.join(&mut good).unwrap();
    let status = net.engine.set_param(
        ParamAttribute::BlacklistAdd as u8,
        0,
        good.identity.as_bytes(),
    );
    assert_eq!(status, lbsd::ParamStatus::Ok);
    let mut retry = net.device(1);
    assert!(net.join(&mut retry).is_err());
    assert!(retry.declined);

    // And lifting it lets the device back in.
    net.engine.set_param(
        ParamAttribute::BlacklistRemove as u8,
        0,
        good.identity.as_bytes(),
    );
    let mut again = net.device(1);
    assert!(net.join(&mut again).is_ok());
}

/// Base 1, capacity 5: five devices fill the pool, the sixth is declined,
/// KICK frees address 3 and the next device gets exactly that address.
#[test]
fn test_pool_exhaustion_and_kick() {
    let mut net = Harness::new(|c| {
        c.bootstrap.short_address_base = 1;
        c.bootstrap.capacity = 5;
    });
    let mut devs: Vec<SimDevice> = (1..=5).map(|n| net.device(n)).collect();
    for (i, d) in devs.iter_mut().enumerate() {
        assert_eq!(net.join(d).unwrap(), ShortAddress(i as u16 + 1));
    }

    let mut sixth = net.device(6);
    assert!(net.join(&mut sixth).is_err());
    assert!(sixth.declined);
    assert_eq!(net.engine.joined_count(), 5);
    net.events();

    let kicked = net.engine.kick(ShortAddress(3), net.now).unwrap();
    assert_eq!(kicked, devs[2].identity);
    let sent = net.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(kind_of(&sent[0]), MessageType::KickToDevice);
    assert_eq!(sent[0].destination, LinkAddress::Short(ShortAddress(3)));
    assert!(sent[0].security_enabled);
    assert_eq!(net.engine.joined_count(), 4);
    assert_eq!(
        net.events(),
        vec![BootstrapEvent::Departed {
            identity: kicked,
            address: ShortAddress(3)
        }]
    );

    let mut seventh = net.device(7);
    assert_eq!(net.join(&mut seventh).unwrap(), ShortAddress(3));
    assert_eq!(net.engine.joined_count(), 5);
}

/// Kicking an address nobody holds is an error and sends nothing.
#[test]
fn test_kick_unknown_address() {
    let mut net = Harness::new(|_| {});
    assert!(net.engine.kick(ShortAddress(9), net.now).is_err());
    assert!(net.link.is_empty());
}

/// A device announcing its own departure frees its address.
#[test]
fn test_device_initiated_leave() {
    let mut net = Harness::new(|_| {});
    let mut dev = net.device(1);
    let addr = net.join(&mut dev).unwrap();
    net.events();

    net.deliver_raw(
        dev.source,
        lbp::frame(MessageType::KickFromDevice, &dev.identity, LbpFlags::NONE, &[]),
    );
    assert_eq!(net.engine.joined_count(), 0);
    assert_eq!(net.engine.extended_address(addr), None);
    assert_eq!(
        net.events(),
        vec![BootstrapEvent::Departed {
            identity: dev.identity,
            address: addr
        }]
    );
}

/// Base 1, capacity 5: A and B take 1 and 2; after KICK 1 the next device
/// gets 3, because the high-water mark has not reached capacity yet.
#[test]
fn test_kick_below_high_water_mark() {
    let mut net = Harness::new(|c| {
        c.bootstrap.short_address_base = 1;
        c.bootstrap.capacity = 5;
    });
    let mut a = net.device(1);
    let mut b = net.device(2);
    assert_eq!(net.join(&mut a).unwrap(), ShortAddress(1));
    assert_eq!(net.join(&mut b).unwrap(), ShortAddress(2));

    net.engine.kick(ShortAddress(1), net.now).unwrap();
    assert_eq!(net.engine.joined_count(), 1);
    assert!(net.engine.device_at(0).is_none());
    assert_eq!(net.engine.extended_address(ShortAddress(1)), None);

    let mut c = net.device(3);
    assert_eq!(net.join(&mut c).unwrap(), ShortAddress(3));
}
