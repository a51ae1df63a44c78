//! End-to-end tests over loopback UDP
//!
//! A manager and a client talk to each other on 127.0.0.1, driven by the
//! same poll calls the periodic tasks of a real node make.

use cm_core::state::feature;
use cm_core::{
    ChargerStatus, Client, ClientConfig, CommandUpdate, Manager, ManagerConfig, NetworkingError,
    StateV1, StaticResolver, StaticSystemState,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::net::UdpSocket;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn client() -> Client {
    let system = StaticSystemState::default()
        .with_feature(feature::EVSE)
        .with_feature(feature::PHASE_SWITCH);
    let config = ClientConfig::default().with_bind_addr(LOCALHOST).with_port(0);
    Client::register(config, system).unwrap()
}

fn manager_for(client_port: u16) -> Manager {
    let config = ManagerConfig::default()
        .with_bind_addr(LOCALHOST)
        .with_port(0)
        .with_client_port(client_port);
    Manager::register(config, &["127.0.0.1"], Arc::new(StaticResolver::new())).unwrap()
}

fn status() -> ChargerStatus {
    ChargerStatus {
        esp32_uid: 0xabcdef,
        iec61851_state: 2,
        charger_state: 3,
        time_since_state_change: 12_000,
        uptime: 3600,
        allowed_charging_current: 6000,
        supported_current: 32000,
        managed: true,
        phases: 3,
        can_switch_phases: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_command_and_state_round_trip() {
    let mut client = client();
    let mut manager = manager_for(client.local_addr().unwrap().port());

    let (command_tx, command_rx) = mpsc::channel();
    client.set_command_callback(move |update| {
        let _ = command_tx.send(update);
    });

    let (state_tx, state_rx) = mpsc::channel();
    manager.set_state_callback(move |device, v1: &StateV1, v2, v3| {
        let _ = state_tx.send((device, *v1, v2.copied(), v3.copied()));
    });

    assert!(manager.send_manager_update(0, 6000, false, 3));

    let mut update = None;
    for _ in 0..200 {
        client.poll();
        if let Ok(received) = command_rx.try_recv() {
            update = Some(received);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        update,
        Some(CommandUpdate {
            allocated_current: 6000,
            cp_disconnect_requested: false,
            allocated_phases: 3,
        })
    );
    assert_eq!(client.manager_addr(), Some(manager.local_addr().unwrap()));

    assert!(client.send_state(&status()));

    let mut state = None;
    for _ in 0..200 {
        manager.poll();
        if let Ok(received) = state_rx.try_recv() {
            state = Some(received);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (device, v1, v2, v3) = state.expect("no state packet arrived");
    assert_eq!(device, 0);
    assert_eq!(v1.esp32_uid, 0xabcdef);
    assert_eq!(v1.iec61851_state, 2);
    assert_eq!(v1.charger_state, 3);
    assert_eq!(v1.evse_uptime, 3600);
    assert_eq!(v1.allowed_charging_current, 6000);
    assert_eq!(v1.supported_current, 32000);
    assert!(v1.is_managed());
    assert!(!v1.cp_disconnected());
    assert!(v1.has_feature(cm_core::feature_flags::EVSE));
    assert!(v1.has_feature(cm_core::feature_flags::PHASE_SWITCH));
    assert_eq!(v1.power_total, 0.0);
    assert_eq!(v2.unwrap().time_since_state_change, 12_000);
    let v3 = v3.unwrap();
    assert_eq!(v3.phase_count(), 3);
    assert!(v3.can_switch_phases());
}

#[tokio::test]
async fn test_manager_reports_unmanaged_and_invalid_packets() {
    let charger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut manager = manager_for(charger.local_addr().unwrap().port());
    let target = manager.local_addr().unwrap();

    let (error_tx, error_rx) = mpsc::channel();
    manager.set_error_callback(move |device, error| {
        let _ = error_tx.send((device, error));
    });
    let (state_tx, state_rx) = mpsc::channel();
    manager.set_state_callback(move |device, _, _, _| {
        let _ = state_tx.send(device);
    });

    let unmanaged = cm_core::state::build_state_packet(
        1,
        &ChargerStatus {
            managed: false,
            ..status()
        },
        &StaticSystemState::default(),
    );
    charger.send_to(&unmanaged.encode(), target).await.unwrap();
    charger.send_to(&[0x42; 20], target).await.unwrap();

    let mut errors = Vec::new();
    for _ in 0..200 {
        manager.poll();
        errors.extend(error_rx.try_iter());
        if errors.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        errors,
        vec![(0, NetworkingError::NotManaged), (0, NetworkingError::InvalidHeader)]
    );
    assert!(state_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_manager_echoes_without_callback() {
    let charger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut manager = manager_for(charger.local_addr().unwrap().port());
    let target = manager.local_addr().unwrap();

    let packet = cm_core::state::build_state_packet(9, &status(), &StaticSystemState::default());
    charger.send_to(&packet.encode(), target).await.unwrap();

    let mut buf = [0u8; 64];
    let mut echo = None;
    for _ in 0..200 {
        manager.poll();
        if let Ok((len, _)) = charger.try_recv_from(&mut buf) {
            echo = Some(cm_core::CommandPacket::decode(&buf[..len]).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let echo = echo.expect("no echo received");
    assert_eq!(echo.header.seq_num, 9);
    assert_eq!(echo.v1.allocated_current, 6000);
    assert_eq!(echo.allocated_phases(), 3);
    assert!(!echo.cp_disconnect_requested());
}
