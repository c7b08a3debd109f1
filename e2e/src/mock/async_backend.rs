use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use futures::{channel::mpsc, executor::block_on, StreamExt};

use crate::{mock::aggregator::Aggregator, BUFFER_SIZE};

/// Handle to a detached thread where a raw TCP origin runs
/// (a thin wrapper around a non blocking TcpListener)
pub struct BackendHandle<T> {
    pub name: String,
    /// where the backend actually listens
    pub address: SocketAddr,
    /// Allows to stop the backend within the thread
    pub stop_tx: mpsc::Sender<()>,
    /// Receives data from the backend on the thread
    pub aggregator_rx: mpsc::Receiver<T>,
}

/// Called on every live connection at each turn of the backend loop
pub type RequestHandler<A> = Box<dyn Fn(&TcpStream, &str, A) -> A + Send + Sync>;

impl<A: Aggregator + Send + Sync + 'static> BackendHandle<A> {
    pub fn spawn_detached_backend<S: Into<String>>(
        name: S,
        address: SocketAddr,
        mut aggregator: A,
        handler: RequestHandler<A>,
    ) -> Self {
        let name = name.into();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (mut aggregator_tx, aggregator_rx) = mpsc::channel::<A>(1);

        let listener = TcpListener::bind(address)
            .unwrap_or_else(|error| panic!("could not bind to {address}: {error}"));
        let address = listener
            .local_addr()
            .expect("could not read the listener address");
        listener
            .set_nonblocking(true)
            .expect("could not set nonblocking on listener");
        println!("{name}: listening on {address}");

        let thread_name = name.to_owned();
        // The backend runs on this detached thread:
        // - accepts tcp connections
        // - calls handler on each live connection
        // - monitors stop_rx to stop itself
        thread::spawn(move || {
            let mut clients = Vec::new();
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        println!("{thread_name}: new connection from {peer}");
                        stream
                            .set_nonblocking(true)
                            .expect("could not set nonblocking on client");
                        clients.push(stream);
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                    Err(error) => println!("{thread_name}: accept error: {error:?}"),
                }
                for client in &clients {
                    aggregator = handler(client, &thread_name, aggregator);
                }
                if let Ok(Some(())) = stop_rx.try_next() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            drop(listener);
            aggregator_tx
                .try_send(aggregator)
                .expect("could not send aggregator");
        });

        Self {
            name,
            address,
            stop_tx,
            aggregator_rx,
        }
    }

    pub fn stop_and_get_aggregator(&mut self) -> Option<A> {
        self.stop_tx.try_send(()).ok()?;
        block_on(self.aggregator_rx.next())
    }
}

fn read_available(mut stream: &TcpStream, backend_name: &str) -> Option<Vec<u8>> {
    let mut buf = [0u8; BUFFER_SIZE];
    match stream.read(&mut buf) {
        Ok(0) => None,
        Ok(n) => Some(buf[..n].to_vec()),
        Err(error) if error.kind() == ErrorKind::WouldBlock => None,
        Err(error) => {
            println!("{backend_name}: read error: {error}");
            None
        }
    }
}

impl<A: Aggregator + Send + Sync + 'static> BackendHandle<A> {
    /// Answers every read with `200 OK` and `content` as body. With `close`,
    /// the connection is shut down after each response.
    pub fn http_handler<S: Into<String>>(content: S, close: bool) -> RequestHandler<A> {
        let content = content.into();
        Box::new(move |stream, backend_name, mut aggregator| {
            let Some(request) = read_available(stream, backend_name) else {
                return aggregator;
            };
            aggregator.add_request(&request);

            let connection = if close { "Connection: close\r\n" } else { "" };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{connection}\r\n{content}",
                content.len()
            );
            let mut writer = stream;
            if let Err(error) = writer.write_all(response.as_bytes()) {
                println!("{backend_name}: could not write response: {error}");
                return aggregator;
            }
            aggregator.add_response();
            if close {
                let _ = stream.shutdown(Shutdown::Both);
            }
            aggregator
        })
    }

    /// Writes back whatever it reads
    pub fn echo_handler() -> RequestHandler<A> {
        Box::new(|stream, backend_name, mut aggregator| {
            let Some(data) = read_available(stream, backend_name) else {
                return aggregator;
            };
            aggregator.add_request(&data);
            let mut writer = stream;
            if writer.write_all(&data).is_ok() {
                aggregator.add_response();
            }
            aggregator
        })
    }

    /// Answers with bytes that are not HTTP
    pub fn garbage_handler() -> RequestHandler<A> {
        Box::new(|stream, backend_name, mut aggregator| {
            let Some(request) = read_available(stream, backend_name) else {
                return aggregator;
            };
            aggregator.add_request(&request);
            let mut writer = stream;
            if writer.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").is_ok() {
                aggregator.add_response();
            }
            aggregator
        })
    }
}
