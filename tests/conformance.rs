//! End-to-end handshake and frame-exchange scenarios, driven over the
//! real loopback UDP transport except where deterministic timing needs
//! the in-process `LoopbackTransport`.

use std::{net::Ipv4Addr, time::Duration};

use lockstep_session::{
    ControllerInput, Endpoint, Session, SessionConfig, SessionError, SessionState, UdpTransport,
};
use lockstep_session::transport::LoopbackTransport;

fn ep(port: u16) -> Endpoint {
    Endpoint::new(Ipv4Addr::LOCALHOST, port)
}

fn equal_state(a: &[u8; 1], b: &[u8; 1]) -> bool {
    a == b
}

type UdpSession = Session<UdpTransport, ControllerInput, [u8; 1]>;

fn udp_session() -> UdpSession {
    Session::new(UdpTransport::new(), SessionConfig::default())
}

#[tokio::test]
async fn s1_two_peer_loopback_happy_path() {
    let creator = udp_session();
    let joiner = udp_session();
    creator.bind(17000).await.expect("creator bind failed");
    joiner.bind(17001).await.expect("joiner bind failed");

    let creator_task = {
        let creator = creator.clone();
        tokio::spawn(async move { creator.create(2, [0x01], equal_state, 5000).await })
    };
    let joined = joiner
        .join(ep(17000), [0x01], equal_state, 5000)
        .await
        .expect("join errored");
    assert!(joined, "joiner failed to reach Ready");
    assert!(
        creator_task.await.expect("creator task panicked").expect("create errored"),
        "creator failed to reach Ready"
    );

    assert!(creator.delay() >= 1, "negotiated delay must be at least 1 frame");
    assert_eq!(creator.delay(), joiner.delay());

    assert!(creator.endpoints().await.contains(&ep(17001)));
    assert!(joiner.endpoints().await.contains(&ep(17000)));

    creator.shutdown().await;
    joiner.shutdown().await;
}

#[tokio::test]
async fn s2_state_mismatch_denies_join() {
    let creator = udp_session();
    let joiner = udp_session();
    creator.bind(17010).await.expect("creator bind failed");
    joiner.bind(17011).await.expect("joiner bind failed");

    let creator_task = {
        let creator = creator.clone();
        tokio::spawn(async move { creator.create(2, [0x01], equal_state, 2000).await })
    };

    let joined = joiner
        .join(ep(17010), [0x02], equal_state, 2000)
        .await
        .expect("join errored");
    assert!(!joined, "join should have been denied on state mismatch");
    assert_eq!(joiner.state(), SessionState::Deny);

    creator_task.abort();
    assert_eq!(creator.state(), SessionState::Wait, "creator should remain waiting");

    creator.shutdown().await;
    joiner.shutdown().await;
}

/// Drives both peers through the delay window and asserts that, once a
/// frame's index has reached the negotiated delay, each side's `get`
/// returns exactly the payload the peer stored for that frame id: every
/// payload embeds the target frame id it was written under, so a
/// mismatch is directly observable.
async fn run_frame_echo(creator: &UdpSession, joiner: &UdpSession, frames: i64) {
    let delay = creator.delay() as i64;
    assert_eq!(delay, joiner.delay() as i64);

    let joiner_side = joiner.side();
    let creator_side = creator.side();

    let creator = creator.clone();
    let creator_task = tokio::spawn(async move {
        for _ in 0..frames {
            let target = creator.frame() + delay;
            creator
                .set(ControllerInput([(target % 256) as u8; 6]))
                .await
                .expect("creator set failed");
            let got = tokio::time::timeout(Duration::from_secs(2), creator.get(joiner_side, 0))
                .await
                .expect("creator get timed out")
                .expect("creator get errored")
                .expect("creator get returned no slot");
            let current = creator.frame();
            if current < delay {
                assert_eq!(got.0, ControllerInput::default().0);
            } else {
                assert_eq!(got.0, [(current % 256) as u8; 6]);
            }
            creator.next_frame();
        }
    });

    for _ in 0..frames {
        let target = joiner.frame() + delay;
        joiner
            .set(ControllerInput([(target % 256) as u8; 6]))
            .await
            .expect("joiner set failed");
        let got = tokio::time::timeout(Duration::from_secs(2), joiner.get(creator_side, 0))
            .await
            .expect("joiner get timed out")
            .expect("joiner get errored")
            .expect("joiner get returned no slot");
        let current = joiner.frame();
        if current < delay {
            assert_eq!(got.0, ControllerInput::default().0);
        } else {
            assert_eq!(got.0, [(current % 256) as u8; 6]);
        }
        joiner.next_frame();
    }

    creator_task.await.expect("creator driver panicked");
}

#[tokio::test]
async fn s3_frame_echo_round_trip() {
    let creator = udp_session();
    let joiner = udp_session();
    creator.bind(17020).await.expect("creator bind failed");
    joiner.bind(17021).await.expect("joiner bind failed");

    let creator_task = {
        let creator = creator.clone();
        tokio::spawn(async move { creator.create(2, [0x01], equal_state, 5000).await })
    };
    let joined = joiner
        .join(ep(17020), [0x01], equal_state, 5000)
        .await
        .expect("join errored");
    assert!(joined);
    assert!(creator_task.await.expect("creator task panicked").expect("create errored"));

    run_frame_echo(&creator, &joiner, 30).await;

    creator.shutdown().await;
    joiner.shutdown().await;
}

#[tokio::test]
async fn s4_packet_loss_still_converges() {
    let creator = udp_session();
    let joiner = udp_session();
    creator.bind(17030).await.expect("creator bind failed");
    joiner.bind(17031).await.expect("joiner bind failed");

    let creator_task = {
        let creator = creator.clone();
        tokio::spawn(async move { creator.create(2, [0x01], equal_state, 5000).await })
    };
    let joined = joiner
        .join(ep(17030), [0x01], equal_state, 5000)
        .await
        .expect("join errored");
    assert!(joined);
    assert!(creator_task.await.expect("creator task panicked").expect("create errored"));

    // 20% loss on every session-level send from here on.
    creator.set_packet_loss(200);
    joiner.set_packet_loss(200);

    let delay = creator.delay() as i64;
    let joiner_side = joiner.side();
    let creator_side = creator.side();

    let creator = creator.clone();
    let creator_task = tokio::spawn(async move {
        for _ in 0..20i64 {
            let target = creator.frame() + delay;
            let payload = ControllerInput([(target % 256) as u8; 6]);
            // No duplicate delivery is observed at the host even though
            // the session may resend: the frame table is write-once per
            // (side, frame_id).
            let got = loop {
                creator.set(payload).await.expect("creator set failed");
                match tokio::time::timeout(Duration::from_millis(150), creator.get(joiner_side, 0))
                    .await
                {
                    Ok(result) => break result.expect("creator get errored").expect("no slot"),
                    Err(_) => continue, // resend and retry past the lost datagram
                }
            };
            let current = creator.frame();
            if current >= delay {
                assert_eq!(got.0, [(current % 256) as u8; 6]);
            }
            creator.next_frame();
        }
    });

    for _ in 0..20i64 {
        let target = joiner.frame() + delay;
        let payload = ControllerInput([(target % 256) as u8; 6]);
        let got = loop {
            joiner.set(payload).await.expect("joiner set failed");
            match tokio::time::timeout(Duration::from_millis(150), joiner.get(creator_side, 0))
                .await
            {
                Ok(result) => break result.expect("joiner get errored").expect("no slot"),
                Err(_) => continue,
            }
        };
        let current = joiner.frame();
        if current >= delay {
            assert_eq!(got.0, [(current % 256) as u8; 6]);
        }
        joiner.next_frame();
    }

    tokio::time::timeout(Duration::from_secs(10), creator_task)
        .await
        .expect("creator driver stalled under loss")
        .expect("creator driver panicked");
}

#[tokio::test]
async fn s5_shutdown_unblocks_pending_get() {
    let creator: Session<LoopbackTransport, ControllerInput, [u8; 1]> =
        Session::new(LoopbackTransport::new(), SessionConfig::default());
    let joiner: Session<LoopbackTransport, ControllerInput, [u8; 1]> =
        Session::new(LoopbackTransport::new(), SessionConfig::default());
    creator.bind(18000).await.expect("creator bind failed");
    joiner.bind(18001).await.expect("joiner bind failed");

    let creator_task = {
        let creator = creator.clone();
        tokio::spawn(async move { creator.create(2, [0x01], equal_state, 5000).await })
    };
    let joined = joiner
        .join(ep(18000), [0x01], equal_state, 5000)
        .await
        .expect("join errored");
    assert!(joined);
    assert!(creator_task.await.expect("creator task panicked").expect("create errored"));

    let joiner_side = joiner.side();
    let creator_for_get = creator.clone();
    let get_task = tokio::spawn(async move { creator_for_get.get(joiner_side, 0).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    creator.shutdown().await;

    let result = tokio::time::timeout(Duration::from_millis(200), get_task)
        .await
        .expect("get did not unblock within 200ms")
        .expect("get task panicked");

    assert!(matches!(result, Err(SessionError::InvalidState)));

    joiner.shutdown().await;
}

#[tokio::test]
async fn s6_join_times_out_against_unreachable_host() {
    let joiner = udp_session();
    joiner.bind(17090).await.expect("joiner bind failed");

    let start = std::time::Instant::now();
    let joined = joiner
        .join(ep(19999), [0x01], equal_state, 500)
        .await
        .expect("join errored");
    let elapsed = start.elapsed();

    assert!(!joined, "join against an unreachable host should fail");
    assert_eq!(joiner.state(), SessionState::None);
    assert!(elapsed >= Duration::from_millis(450));
    assert!(elapsed < Duration::from_secs(5));

    joiner.shutdown().await;
}
