//! Virtual-IP failover scenario
//!
//! Two agents compete for one VIP. The winner binds `eth0:zvip0`; when
//! its session expires, the alias is released on the losing host and the
//! surviving agent acquires the lease and binds the address itself.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quay::coord::memory::MemoryCoordinator;
use quay::coord::{CreateMode, SessionExt};
use quay::model::{Pool, VirtualIp};
use quay::vip::iface::FakeInterfaces;
use quay::vip::VipWatcher;

async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn vip_fails_over_when_the_holder_expires() {
    let coordinator = MemoryCoordinator::new();
    let admin = coordinator.session();
    admin.ensure("/pools").await.unwrap();
    admin
        .create_json(
            "/pools/default",
            &Pool {
                id: "default".into(),
                virtual_ips: vec![VirtualIp {
                    pool_id: "default".into(),
                    ip: "10.0.0.5".into(),
                    netmask: "255.255.255.0".into(),
                    bind_interface: "eth0".into(),
                }],
            },
            CreateMode::PERSISTENT,
        )
        .await
        .unwrap();
    admin.ensure("/virtual_ips/10.0.0.5").await.unwrap();

    let ifaces_one = Arc::new(FakeInterfaces::new());
    let ifaces_two = Arc::new(FakeInterfaces::new());
    let session_one = coordinator.session();
    let session_two = coordinator.session();

    let shutdown = CancellationToken::new();
    let agent_one = VipWatcher::new(session_one.clone(), ifaces_one.clone(), "h1", "default");
    let agent_two = VipWatcher::new(session_two.clone(), ifaces_two.clone(), "h2", "default");
    let (s1, s2) = (shutdown.clone(), shutdown.clone());
    let task_one = tokio::spawn(async move { agent_one.run(s1).await });
    let task_two = tokio::spawn(async move { agent_two.run(s2).await });

    // exactly one agent wins and binds eth0:zvip0
    let (a, b) = (ifaces_one.clone(), ifaces_two.clone());
    wait_until("a single holder", move || {
        a.bound_aliases().len() + b.bound_aliases().len() == 1
    })
    .await;
    let one_won = ifaces_one.bound_aliases() == vec!["eth0:zvip0".to_string()];
    let (winner_ifaces, winner_session, winner_task, loser_ifaces) = if one_won {
        (ifaces_one.clone(), session_one, task_one, ifaces_two.clone())
    } else {
        assert_eq!(ifaces_two.bound_aliases(), vec!["eth0:zvip0".to_string()]);
        (ifaces_two.clone(), session_two, task_two, ifaces_one.clone())
    };

    // the holder's session expires: its alias goes away and the survivor
    // binds the address on its own host
    coordinator.expire(&winner_session);
    let stale = winner_ifaces.clone();
    wait_until("stale alias to be unbound", move || {
        stale.bound_aliases().is_empty()
    })
    .await;
    let survivor = loser_ifaces.clone();
    wait_until("survivor to bind the VIP", move || {
        survivor.bound_aliases() == vec!["eth0:zvip0".to_string()]
    })
    .await;

    // the expired watcher surfaces the session loss to its reconnect loop
    let err = winner_task.await.unwrap().unwrap_err();
    assert!(err.is_session_loss());

    shutdown.cancel();
}
