//! Drives a full control-channel handshake over a loopback TCP pair:
//! request, barrier, and the symmetric statistics exchange.

use std::net::TcpListener;
use std::thread;

use netbench_core::{Control, Request, Stat, UStat};

fn loopback_pair() -> (Control, Control) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || Control::accept(&listener).unwrap());
    let client = Control::connect("127.0.0.1", port, 0).unwrap();
    (client, server.join().unwrap())
}

fn request_for(test_index: u16) -> Request {
    Request {
        msg_size: 65536,
        time: 2,
        timeout: 5,
        id: "mlx5_0".into(),
        ..Default::default()
    }
    .versioned(test_index)
}

#[test]
fn request_round_trips_over_the_channel() {
    let (mut client, mut server) = loopback_pair();
    let sent = request_for(4);
    let sent_clone = sent.clone();

    let tx = thread::spawn(move || {
        client.send_request(&sent_clone).unwrap();
        client
    });
    let got = server.recv_request(32).unwrap();
    tx.join().unwrap();
    assert_eq!(got, sent);
}

#[test]
fn unknown_test_index_is_refused() {
    let (mut client, mut server) = loopback_pair();
    let sent = request_for(31);

    let tx = thread::spawn(move || {
        client.send_request(&sent).unwrap();
        client
    });
    let err = server.recv_request(8).unwrap_err();
    tx.join().unwrap();
    assert!(matches!(err, netbench_core::Error::BadTest(31)));
}

#[test]
fn barrier_releases_both_sides() {
    let (mut client, mut server) = loopback_pair();
    let t = thread::spawn(move || server.synchronize("test barrier"));
    assert!(client.synchronize("test barrier"));
    assert!(t.join().unwrap());
}

#[test]
fn barrier_reports_a_dead_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let t = thread::spawn(move || {
        let c = Control::accept(&listener).unwrap();
        drop(c);
    });
    let mut client = Control::connect("127.0.0.1", port, 0).unwrap();
    t.join().unwrap();
    assert!(!client.synchronize("dead peer"));
}

#[test]
fn statistics_exchange_is_symmetric() {
    let (mut client, mut server) = loopback_pair();

    let mut client_stat = Stat::default();
    client_stat.s = UStat {
        no_bytes: 1 << 20,
        no_msgs: 16,
        no_errs: 0,
    };
    let mut server_stat = Stat::default();
    server_stat.r = UStat {
        no_bytes: 1 << 20,
        no_msgs: 16,
        no_errs: 0,
    };

    let cs = client_stat.clone();
    let t = thread::spawn(move || {
        let peer = server.exchange_results(&server_stat).unwrap();
        (server_stat, peer)
    });
    let peer_of_client = client.exchange_results(&client_stat).unwrap();
    let (server_stat, peer_of_server) = t.join().unwrap();

    // after the exchange each side holds exactly the other's block
    assert_eq!(peer_of_client, server_stat);
    assert_eq!(peer_of_server, cs);
}
