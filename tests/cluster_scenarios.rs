//! End-to-end scenarios against real `Multiplexer` instances over real
//! loopback UDP sockets. Each test uses its own multicast group and port
//! pair so they can run concurrently.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use vrcluster_mux::{Config, GatherOp, Multiplexer, ThreadId};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(51000);

fn next_ports(n: u16) -> u16 {
    PORT_COUNTER.fetch_add(n, Ordering::Relaxed)
}

fn fast_config() -> Config {
    Config {
        connection_wait_timeout: Duration::from_millis(30),
        ping_timeout: Duration::from_secs(5),
        max_ping_requests: 3,
        receive_wait_timeout: Duration::from_millis(30),
        barrier_wait_timeout: Duration::from_millis(30),
        send_buffer_size: 20,
        master_message_burst_size: 2,
        slave_message_burst_size: 2,
    }
}

async fn spawn_cluster(
    num_slaves: usize,
    group: &str,
    cfg: Config,
) -> (Multiplexer, Vec<Multiplexer>) {
    let master_port = next_ports(1 + num_slaves as u16);
    let slave_port = master_port + 1;

    let master = Multiplexer::new(
        num_slaves,
        0,
        "127.0.0.1",
        master_port,
        group,
        slave_port,
        cfg.clone(),
    )
    .await
    .expect("master should start");

    let mut slaves = Vec::with_capacity(num_slaves);
    for i in 0..num_slaves {
        let slave = Multiplexer::new(
            num_slaves,
            (i + 1) as u32,
            "127.0.0.1",
            master_port,
            group,
            slave_port,
            cfg.clone(),
        )
        .await
        .expect("slave should start");
        slaves.push(slave);
    }
    (master, slaves)
}

/// spec.md §8 scenario 1: trivial handshake, N=1.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trivial_handshake_completes() {
    let (master, slaves) = spawn_cluster(1, "239.255.21.1", fast_config()).await;
    let slave = &slaves[0];

    tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(master.wait_for_connection(), slave.wait_for_connection())
    })
    .await
    .expect("both sides should connect within two connection_wait_timeout intervals");

    master.shutdown().await;
    slave.shutdown().await;
}

/// spec.md §8 scenario 2: open-send-receive, N=2.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn open_send_receive_delivers_same_bytes() {
    let (master, slaves) = spawn_cluster(2, "239.255.21.2", fast_config()).await;

    master.wait_for_connection().await;
    for s in &slaves {
        s.wait_for_connection().await;
    }

    let thread_id = ThreadId::new(vec![0xbeef]);
    let (master_pipe, slave0_pipe, slave1_pipe) = tokio::join!(
        master.open_pipe(thread_id.clone()),
        slaves[0].open_pipe(thread_id.clone()),
        slaves[1].open_pipe(thread_id),
    );
    let master_pipe = master_pipe.expect("master open_pipe");
    assert_eq!(master_pipe, slave0_pipe.expect("slave 0 open_pipe"));
    assert_eq!(master_pipe, slave1_pipe.expect("slave 1 open_pipe"));

    let payload = vec![0xab_u8; 100];
    let (send_result, p0, p1) = tokio::join!(
        master.send_packet(master_pipe, &payload),
        slaves[0].receive_packet(master_pipe),
        slaves[1].receive_packet(master_pipe),
    );
    send_result.expect("send_packet should succeed");
    let p0 = p0.expect("slave 0 receive_packet");
    let p1 = p1.expect("slave 1 receive_packet");

    assert_eq!(p0.len(), 100);
    assert_eq!(p0.payload(), payload.as_slice());
    assert_eq!(p1.len(), 100);
    assert_eq!(p1.payload(), payload.as_slice());

    master.shutdown().await;
    for s in &slaves {
        s.shutdown().await;
    }
}

/// spec.md §8 scenario 3 (approximated): five packets sent back-to-back
/// arrive at the slave in order and intact. The loss-and-resend path
/// itself (dropping the first datagram of a pipe) needs a network-level
/// fault injector this transport doesn't expose a hook for; its logic is
/// covered directly by the retransmission-window unit tests in `pipe.rs`
/// instead.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiple_packets_arrive_in_order() {
    let (master, slaves) = spawn_cluster(1, "239.255.21.3", fast_config()).await;
    let slave = &slaves[0];

    master.wait_for_connection().await;
    slave.wait_for_connection().await;

    let thread_id = ThreadId::new(vec![0x5e17]);
    let (master_pipe, slave_pipe) = tokio::join!(
        master.open_pipe(thread_id.clone()),
        slave.open_pipe(thread_id)
    );
    let master_pipe = master_pipe.expect("master open_pipe");
    assert_eq!(master_pipe, slave_pipe.expect("slave open_pipe"));

    let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 1000]).collect();
    for p in &payloads {
        master
            .send_packet(master_pipe, p)
            .await
            .expect("send_packet should succeed");
    }

    for expected in &payloads {
        let packet = slave
            .receive_packet(master_pipe)
            .await
            .expect("receive_packet should succeed");
        assert_eq!(packet.payload(), expected.as_slice());
    }

    master.shutdown().await;
    slave.shutdown().await;
}

/// spec.md §8 scenario 4: barrier synchronizes, N=3.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_synchronizes_all_nodes() {
    let (master, slaves) = spawn_cluster(3, "239.255.21.4", fast_config()).await;

    master.wait_for_connection().await;
    for s in &slaves {
        s.wait_for_connection().await;
    }

    let thread_id = ThreadId::new(vec![0xba12]);
    let master_pipe = master
        .open_pipe(thread_id.clone())
        .await
        .expect("master open_pipe");
    for s in &slaves {
        let pipe = s
            .open_pipe(thread_id.clone())
            .await
            .expect("slave open_pipe");
        assert_eq!(pipe, master_pipe);
    }

    for _ in 0..10 {
        master
            .send_packet(master_pipe, b"tick")
            .await
            .expect("send_packet should succeed");
    }
    for s in &slaves {
        for _ in 0..10 {
            s.receive_packet(master_pipe)
                .await
                .expect("receive_packet should succeed");
        }
    }

    let slave_handles: Vec<_> = slaves
        .iter()
        .cloned()
        .map(|s| tokio::spawn(async move { s.barrier(master_pipe).await }))
        .collect();

    tokio::time::timeout(Duration::from_secs(2), master.barrier(master_pipe))
        .await
        .expect("master barrier should not time out")
        .expect("master barrier should succeed");

    for handle in slave_handles {
        handle
            .await
            .expect("slave barrier task should not panic")
            .expect("slave barrier should succeed");
    }

    master.shutdown().await;
    for s in &slaves {
        s.shutdown().await;
    }
}

/// spec.md §8 scenario 5: gather with MAX, N=2. Master contributes 7,
/// slave 1 contributes 4, slave 2 contributes 11; every node observes 11.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn gather_max_reduces_to_largest_value() {
    let (master, slaves) = spawn_cluster(2, "239.255.21.5", fast_config()).await;

    master.wait_for_connection().await;
    for s in &slaves {
        s.wait_for_connection().await;
    }

    let thread_id = ThreadId::new(vec![0x9a7e]);
    let master_pipe = master
        .open_pipe(thread_id.clone())
        .await
        .expect("master open_pipe");
    for s in &slaves {
        let pipe = s
            .open_pipe(thread_id.clone())
            .await
            .expect("slave open_pipe");
        assert_eq!(pipe, master_pipe);
    }

    let (master_result, slave0_result, slave1_result) = tokio::join!(
        master.gather(master_pipe, 7, GatherOp::Max),
        slaves[0].gather(master_pipe, 4, GatherOp::Max),
        slaves[1].gather(master_pipe, 11, GatherOp::Max),
    );

    assert_eq!(master_result.expect("master gather"), 11);
    assert_eq!(slave0_result.expect("slave 0 gather"), 11);
    assert_eq!(slave1_result.expect("slave 1 gather"), 11);

    master.shutdown().await;
    for s in &slaves {
        s.shutdown().await;
    }
}
