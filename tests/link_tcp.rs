mod common;

use std::time::Duration;

use common::{closed_port, TestServer, WriteRecord};
use mover_link::register_map::{mover_status, recipe, single_axis};
use mover_link::tokio::sync::broadcast;
use mover_link::{
    ConnectionState, JogDirection, KeepAliveConfig, LinkConfig, LinkEvent, MoverLink, MoverState,
    StationRecipe,
};

const CONTROL: u16 = single_axis::CONTROL_WORD;

fn quiet_config() -> LinkConfig {
    LinkConfig::default()
        .with_keepalive_enabled(false)
        .with_polling(false)
}

fn drain(rx: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn connected(server: &TestServer, config: LinkConfig) -> MoverLink {
    let link = MoverLink::new(config).unwrap();
    link.try_connect("127.0.0.1", server.port(), 1).await.unwrap();
    link
}

#[tokio::test]
async fn connect_refused_publishes_state_and_failure() {
    let link = MoverLink::new(quiet_config()).unwrap();
    let mut rx = link.subscribe();

    assert!(!link.connect("127.0.0.1", closed_port().await, 1).await);
    assert!(!link.is_connected());

    let events = drain(&mut rx);
    assert_eq!(
        events[..2],
        [
            LinkEvent::StateChanged {
                old: ConnectionState::Unconnected,
                new: ConnectionState::Connecting,
            },
            LinkEvent::StateChanged {
                old: ConnectionState::Connecting,
                new: ConnectionState::Unconnected,
            },
        ]
    );
    match &events[2] {
        LinkEvent::OperationFailed { operation, detail } => {
            assert_eq!(operation, "connect");
            assert!(detail.to_lowercase().contains("refused"), "{}", detail);
        }
        other => panic!("unexpected event {:?}", other),
    }
    link.shutdown().await;
}

#[tokio::test]
async fn bit_update_falls_back_when_mask_write_rejected() {
    let server = TestServer::start().await;
    server.set_register(CONTROL, 0x8004).await;
    server.set_mask_write_supported(false);
    let link = connected(&server, quiet_config()).await;

    link.set_enable(true).await.unwrap();

    assert_eq!(server.register(CONTROL).await, 0x8005);
    // Rejected FC22 never reaches the write log; the fallback FC06 does.
    assert_eq!(
        server.writes().await,
        vec![WriteRecord {
            function: 0x06,
            address: CONTROL,
            values: vec![0x8005],
        }]
    );
    let stats = link.bit_update_stats();
    assert_eq!((stats.updates, stats.degraded, stats.failures), (1, 1, 0));
    link.disconnect().await;
}

#[tokio::test]
async fn jog_uses_mask_write_when_supported() {
    let server = TestServer::start().await;
    server.set_register(CONTROL, 1 << 4).await;
    let link = connected(&server, quiet_config()).await;

    link.jog(JogDirection::Left).await.unwrap();

    assert_eq!(server.register(CONTROL).await, 1 << 3);
    let writes = server.writes().await;
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().all(|w| w.function == 0x16));
    // Right cleared before left is set.
    assert_eq!(writes[0].values, vec![!(1u16 << 4), 0]);
    assert_eq!(writes[1].values, vec![!(1u16 << 3), 1 << 3]);
    assert_eq!(link.bit_update_stats().degraded, 0);
    link.disconnect().await;
}

#[tokio::test]
async fn recipe_apply_writes_count_before_blocks() {
    let server = TestServer::start().await;
    let link = connected(&server, quiet_config()).await;

    for index in (5..10).rev() {
        link.remove_station(index).await.unwrap();
    }
    link.save_complete_recipe("five", "").await.unwrap();
    link.apply_complete_recipe("five").await.unwrap();

    let writes = server.writes().await;
    assert_eq!(writes.len(), 6);
    assert_eq!(
        writes[0],
        WriteRecord {
            function: 0x06,
            address: recipe::STATION_COUNT,
            values: vec![5],
        }
    );
    for (index, write) in writes[1..].iter().enumerate() {
        assert_eq!(write.function, 0x10);
        assert_eq!(write.address, recipe::BASE + 8 * index as u16);
        assert_eq!(write.values.len(), StationRecipe::REGISTERS);
    }

    let read_back = link.read_station(2).await.unwrap();
    assert_eq!(read_back.station_no, 3);
    assert_eq!(read_back.segment_position, 188 + 2 * 120);
    link.disconnect().await;
}

#[tokio::test]
async fn status_poll_and_move_over_tcp() {
    let server = TestServer::start().await;
    let base = mover_status::BASE + mover_status::STRIDE;
    // Mover 1: 2.5 mm, enabled and running.
    server.set_register(base, 2500).await;
    server.set_register(base + mover_status::STATUS_WORD, 0b011).await;
    let link = connected(&server, quiet_config().with_axis_count(2)).await;

    let movers = link.read_all_status().await.unwrap();
    assert_eq!(movers[1].position, 2.5);
    assert_eq!(movers[1].state, MoverState::Running);
    assert_eq!(movers[0].state, MoverState::Disabled);

    link.move_to(1, -1.0).await.unwrap();
    let target = base + mover_status::TARGET_LOW;
    assert_eq!(server.register(target).await, 0xFC18);
    assert_eq!(server.register(target + 1).await, 0xFFFF);
    link.disconnect().await;
    assert!(!link.mover(1).unwrap().connected);
}

#[tokio::test]
async fn heartbeat_toggles_while_connected() {
    let server = TestServer::start().await;
    server.set_register(CONTROL, 0x0001).await;
    let config = quiet_config().with_keepalive(KeepAliveConfig {
        interval: Duration::from_millis(100),
        grace: Duration::from_millis(10),
        ..KeepAliveConfig::default()
    });
    let link = connected(&server, config).await;

    let mut heartbeats = Vec::new();
    for _ in 0..100 {
        heartbeats = server
            .writes()
            .await
            .into_iter()
            .filter(|w| w.function == 0x16)
            .collect();
        if heartbeats.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(heartbeats.len() >= 3, "saw {} heartbeats", heartbeats.len());
    let or_masks: Vec<u16> = heartbeats.iter().take(3).map(|w| w.values[1]).collect();
    assert_eq!(or_masks, vec![0x8000, 0x0000, 0x8000]);
    assert_eq!(server.register(CONTROL).await & 0x7FFF, 0x0001);

    link.disconnect().await;
    let count = server.writes().await.len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.writes().await.len(), count);
    link.shutdown().await;
}
