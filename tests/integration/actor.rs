use crate::*;

use tokio::sync::broadcast;

use lbsd::{BootstrapService, ParamAttribute, ParamStatus, ServiceHandle};

struct Running {
    handle: ServiceHandle,
    link: Arc<MemoryLink>,
    events: mpsc::Receiver<BootstrapEvent>,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<BootstrapEngine>,
    psk: Psk,
}

fn start(configure: impl FnOnce(&mut BootstrapConfig)) -> Running {
    let mut config = BootstrapConfig::default();
    configure(&mut config);
    let link = Arc::new(MemoryLink::new(MAX_HOPS));
    let mut engine = BootstrapEngine::new(&config, link.clone()).unwrap();
    let (observer, events) = ChannelObserver::new(64);
    engine.set_observer(Arc::new(observer));
    let (shutdown, rx) = broadcast::channel(1);
    let (service, handle) = BootstrapService::new(engine, config.tick_interval(), rx);
    Running {
        handle,
        link,
        events,
        shutdown,
        task: tokio::spawn(service.run()),
        psk: config.psk().unwrap(),
    }
}

/// Feed link traffic back through the service until it goes quiet.
async fn pump(run: &Running, device: &mut SimDevice) {
    for _ in 0..100 {
        // Any request/reply call orders us after every earlier command.
        run.handle.joined_count().await.unwrap();
        let sent = run.link.take();
        if sent.is_empty() {
            return;
        }
        for request in sent {
            run.handle
                .confirmation(Confirmation {
                    handle: request.handle,
                    status: SendStatus::Success,
                })
                .await
                .unwrap();
            let frame = lbp::decode(&request.payload, Direction::ToDevice).unwrap();
            if frame.identity != device.identity {
                continue;
            }
            if let Some(reply) = device.respond(&frame) {
                run.handle
                    .indication(Indication {
                        source: device.source,
                        security_enabled: false,
                        link_quality: 90,
                        payload: lbp::frame(
                            MessageType::Joining,
                            &device.identity,
                            LbpFlags::NONE,
                            &reply,
                        ),
                    })
                    .await
                    .unwrap();
            }
        }
    }
    panic!("link never went quiet");
}

async fn join(run: &Running, n: u8) -> SimDevice {
    let mut device = SimDevice::new(&run.psk, DeviceIdentity::new([0xC0, 0, 0, 0, 0, 0, 0, n]));
    run.handle
        .indication(Indication {
            source: device.source,
            security_enabled: false,
            link_quality: 90,
            payload: lbp::frame(MessageType::Joining, &device.identity, LbpFlags::NONE, &[]),
        })
        .await
        .unwrap();
    pump(run, &mut device).await;
    device
}

// ══════════════════════════════════════════════════════════════════════════════
//  Service task
// ══════════════════════════════════════════════════════════════════════════════

/// A join driven through the service handle ends in a Joined event.
#[tokio::test]
async fn test_join_through_service() {
    let mut run = start(|_| {});
    let dev = join(&run, 1).await;
    assert!(dev.accepted);
    assert_eq!(run.handle.joined_count().await.unwrap(), 1);

    let entry = run.handle.device(0).await.unwrap().unwrap();
    assert_eq!(entry.identity, dev.identity);
    assert_eq!(
        run.events.recv().await,
        Some(BootstrapEvent::Joined {
            identity: dev.identity,
            address: ShortAddress(1)
        })
    );

    run.shutdown.send(()).unwrap();
    let engine = run.task.await.unwrap();
    assert_eq!(engine.joined_count(), 1);
}

/// Admin kick, parameter access and reset over the handle.
#[tokio::test]
async fn test_admin_through_service() {
    let mut run = start(|c| c.bootstrap.capacity = 4);
    let dev = join(&run, 1).await;
    run.events.recv().await;

    let entry = run
        .handle
        .get_param(ParamAttribute::DeviceListEntry as u8, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&entry[..8], dev.identity.as_bytes());
    assert_eq!(&entry[8..], &[0, 1, 1]);

    let kicked = run.handle.kick(ShortAddress(1)).await.unwrap().unwrap();
    assert_eq!(kicked, dev.identity);
    assert!(matches!(
        run.events.recv().await,
        Some(BootstrapEvent::Departed { .. })
    ));
    assert_eq!(run.handle.joined_count().await.unwrap(), 0);

    assert_eq!(
        run.handle
            .set_param(ParamAttribute::MsgTimeout as u8, 0, vec![0, 9])
            .await
            .unwrap(),
        ParamStatus::Ok
    );
    run.handle.reset().await.unwrap().unwrap();
    assert_eq!(
        run.handle
            .get_param(ParamAttribute::MsgTimeout as u8, 0)
            .await
            .unwrap(),
        Ok(vec![0, 40])
    );

    run.shutdown.send(()).unwrap();
    run.task.await.unwrap();
}

/// Rekey launched through the service completes as devices answer.
#[tokio::test]
async fn test_rekey_through_service() {
    let mut run = start(|_| {});
    let mut dev = join(&run, 1).await;
    run.events.recv().await;

    run.handle.launch_rekey().await.unwrap().unwrap();
    assert!(run.handle.rekey_progress().await.unwrap().is_some());
    pump(&run, &mut dev).await;

    assert!(run.handle.rekey_progress().await.unwrap().is_none());
    assert!(matches!(
        run.events.recv().await,
        Some(BootstrapEvent::RekeyCompleted { .. })
    ));
    assert_eq!(dev.active_key, Some(1));

    run.shutdown.send(()).unwrap();
    run.task.await.unwrap();
}
