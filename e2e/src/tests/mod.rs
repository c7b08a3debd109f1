use std::net::SocketAddr;

use fwdproxy_command::{config::Config, logging::setup_test_logger};
use fwdproxy_lib::Proxy;

mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Success,
    Fail,
}

/// Starts a proxy on an ephemeral loopback port
pub fn setup_proxy(name: &str) -> Proxy {
    setup_test_logger("info");
    log::info!("starting proxy for {}", name);

    let config = Config {
        listen_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        worker_count: 2,
        resolver_threads: 1,
        initial_accepts: 4,
        request_pool_static: 8,
        request_pool_dynamic: 8,
        connect_timeout_seconds: 2,
        ..Config::default()
    };
    Proxy::start(&config).expect("could not start the proxy")
}

/// an address nothing listens on
pub fn closed_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("could not bind");
    listener.local_addr().expect("could not read address")
}

pub fn repeat_until_error_or<F>(times: usize, test_description: &str, test: F) -> State
where
    F: Fn() -> State,
{
    println!("{test_description}");
    for iteration in 0..times {
        let state = test();
        if state != State::Success {
            println!("------------------------------------------------------------------");
            println!("Test not successful after {iteration} iterations");
            return state;
        }
    }
    println!("------------------------------------------------------------------");
    println!("Test successful after {times} iterations");
    State::Success
}
