use serial_test::serial;

use crate::{
    mock::{
        aggregator::RecordingAggregator,
        async_backend::BackendHandle,
        client::Client,
        http_origin::HttpOrigin,
    },
    tests::{closed_address, repeat_until_error_or, setup_proxy, State},
};

const BANNER: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn absolute_get(authority: impl std::fmt::Display, path: &str) -> String {
    format!(
        "GET http://{authority}{path} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    )
}

pub fn try_plain_get() -> State {
    let mut proxy = setup_proxy("PLAIN_GET");
    let mut origin = HttpOrigin::start("pong");

    let mut client = Client::new("client", proxy.local_address());
    client.connect();
    client.send(absolute_get(origin.address, "/hello?x=1").as_bytes());

    let Some(response) = client.receive_response() else {
        println!("no response");
        return State::Fail;
    };
    if !response.starts_with("HTTP/1.1 200") || !response.ends_with("pong") {
        println!("unexpected response: {response}");
        return State::Fail;
    }

    let requests = origin.requests();
    let [request] = requests.as_slice() else {
        println!("origin saw {} requests", requests.len());
        return State::Fail;
    };
    if request.method != "GET"
        || request.url != "/hello?x=1"
        || request.header("Proxy-Connection").is_some()
        || request.header("Connection") != Some("keep-alive")
    {
        println!("request was not rewritten: {request:?}");
        return State::Fail;
    }

    // same connection, same host
    client.send(absolute_get(origin.address, "/again").as_bytes());
    match client.receive_response() {
        Some(response) if response.ends_with("pong") => {}
        other => {
            println!("second response: {other:?}");
            return State::Fail;
        }
    }

    let statistics = proxy.statistics();
    proxy.shutdown();
    if statistics.requests == 2 && statistics.in_bytes > 0 && statistics.out_bytes > 0 {
        State::Success
    } else {
        println!("unexpected statistics: {statistics:?}");
        State::Fail
    }
}

pub fn try_connect_tunnel() -> State {
    let mut proxy = setup_proxy("CONNECT");
    let mut backend = BackendHandle::<RecordingAggregator>::spawn_detached_backend(
        "ECHO",
        "127.0.0.1:0".parse().unwrap(),
        RecordingAggregator::default(),
        BackendHandle::echo_handler(),
    );

    let mut client = Client::new("client", proxy.local_address());
    client.connect();
    client.send(
        format!(
            "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
            backend.address
        )
        .as_bytes(),
    );

    match client.receive_exact(BANNER.len()) {
        Some(banner) if banner == BANNER => {}
        other => {
            println!("unexpected banner: {other:?}");
            return State::Fail;
        }
    }

    let payload = b"\x16\x03\x01 not really a client hello";
    client.send(payload);
    let echoed = client.receive_exact(payload.len());

    proxy.shutdown();
    let aggregator = backend.stop_and_get_aggregator();

    if echoed.as_deref() != Some(&payload[..]) {
        println!("tunnel altered the payload: {echoed:?}");
        return State::Fail;
    }
    match aggregator {
        Some(aggregator) if aggregator.requests.concat().as_bytes() == payload => State::Success,
        other => {
            println!("backend saw {other:?}");
            State::Fail
        }
    }
}

pub fn try_failed_connect_evicts_cache() -> State {
    let mut proxy = setup_proxy("FAILED_CONNECT");
    let closed = closed_address();

    let mut client = Client::new("client", proxy.local_address());
    client.connect();
    client.send(absolute_get(closed, "/").as_bytes());
    if !client.is_closed() {
        println!("the proxy should close the browser connection");
        return State::Fail;
    }

    let origin = HttpOrigin::start("cached");
    for index in 0..2 {
        let mut client = Client::new(format!("client{index}"), proxy.local_address());
        client.connect();
        client.send(absolute_get(origin.address, "/").as_bytes());
        if client.receive_response().is_none() {
            println!("no response from the live origin");
            return State::Fail;
        }
    }
    let after_live = proxy.statistics();

    // the failed address was evicted, it has to be looked up again
    let mut client = Client::new("again", proxy.local_address());
    client.connect();
    client.send(absolute_get(closed, "/").as_bytes());
    let closed_again = client.is_closed();

    let statistics = proxy.statistics();
    proxy.shutdown();

    if closed_again
        && after_live.dns_queries == 3
        && after_live.dns_cache_hits == 1
        && statistics.dns_queries == 4
        && statistics.dns_cache_hits == 1
    {
        State::Success
    } else {
        println!("unexpected statistics: {after_live:?} then {statistics:?}");
        State::Fail
    }
}

pub fn try_server_close_then_new_host() -> State {
    let mut proxy = setup_proxy("SERVER_CLOSE");
    let mut first = BackendHandle::<RecordingAggregator>::spawn_detached_backend(
        "CLOSING",
        "127.0.0.1:0".parse().unwrap(),
        RecordingAggregator::default(),
        BackendHandle::http_handler("first", true),
    );
    let mut second = HttpOrigin::start("second");

    let mut client = Client::new("client", proxy.local_address());
    client.connect();

    client.send(absolute_get(first.address, "/a").as_bytes());
    match client.receive_response() {
        Some(response) if response.ends_with("first") => {}
        other => {
            println!("first response: {other:?}");
            return State::Fail;
        }
    }

    client.send(absolute_get(second.address, "/b").as_bytes());
    let response = client.receive_response();

    proxy.shutdown();
    let aggregator = first.stop_and_get_aggregator();
    let requests = second.requests();

    let first_ok = aggregator
        .map(|aggregator| {
            aggregator.requests.len() == 1 && aggregator.requests[0].starts_with("GET /a HTTP/1.1\r\n")
        })
        .unwrap_or(false);
    let second_ok = requests.len() == 1 && requests[0].url == "/b";

    match response {
        Some(response) if response.ends_with("second") && first_ok && second_ok => State::Success,
        other => {
            println!("second response: {other:?}, first origin ok: {first_ok}, second origin ok: {second_ok}");
            State::Fail
        }
    }
}

pub fn try_non_http_response() -> State {
    let mut proxy = setup_proxy("NON_HTTP");
    let mut backend = BackendHandle::<RecordingAggregator>::spawn_detached_backend(
        "GARBAGE",
        "127.0.0.1:0".parse().unwrap(),
        RecordingAggregator::default(),
        BackendHandle::garbage_handler(),
    );

    let mut client = Client::new("client", proxy.local_address());
    client.connect();
    client.send(absolute_get(backend.address, "/").as_bytes());
    let closed = client.is_closed();

    proxy.shutdown();
    backend.stop_and_get_aggregator();
    if closed {
        State::Success
    } else {
        State::Fail
    }
}

#[test]
#[serial]
fn test_plain_get() {
    assert_eq!(try_plain_get(), State::Success);
}

#[test]
#[serial]
fn test_connect_tunnel() {
    assert_eq!(try_connect_tunnel(), State::Success);
}

#[test]
#[serial]
fn test_failed_connect_evicts_cache() {
    assert_eq!(try_failed_connect_evicts_cache(), State::Success);
}

#[test]
#[serial]
fn test_server_close_then_new_host() {
    assert_eq!(try_server_close_then_new_host(), State::Success);
}

#[test]
#[serial]
fn test_non_http_response() {
    assert_eq!(try_non_http_response(), State::Success);
}

#[test]
#[serial]
fn test_repeated_start_and_stop() {
    assert_eq!(
        repeat_until_error_or(
            5,
            "Start and stop: every request is served and the proxy shuts down cleanly",
            try_plain_get
        ),
        State::Success
    );
}
