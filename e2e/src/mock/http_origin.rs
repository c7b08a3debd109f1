use std::{net::SocketAddr, thread, time::Duration};

use futures::channel::mpsc;

/// What the origin saw of one request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A keep-alive HTTP origin answering `200 OK` with a fixed body
pub struct HttpOrigin {
    pub address: SocketAddr,
    stop_tx: mpsc::Sender<()>,
    requests_rx: mpsc::UnboundedReceiver<RecordedRequest>,
}

impl HttpOrigin {
    pub fn start<S: Into<String>>(body: S) -> Self {
        let body = body.into();
        let server = tiny_http::Server::http("127.0.0.1:0").expect("could not start the origin");
        let address = server
            .server_addr()
            .to_ip()
            .expect("the origin should listen on an IP address");
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (requests_tx, requests_rx) = mpsc::unbounded();

        thread::spawn(move || loop {
            if let Ok(Some(())) = stop_rx.try_next() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(20)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(error) => {
                    println!("origin: {error}");
                    break;
                }
            };

            let recorded = RecordedRequest {
                method: request.method().to_string(),
                url: request.url().to_owned(),
                headers: request
                    .headers()
                    .iter()
                    .map(|header| (header.field.to_string(), header.value.to_string()))
                    .collect(),
            };
            let _ = requests_tx.unbounded_send(recorded);

            if let Err(error) = request.respond(tiny_http::Response::from_string(body.clone())) {
                println!("origin: could not respond: {error}");
            }
        });

        Self {
            address,
            stop_tx,
            requests_rx,
        }
    }

    /// requests received since the last call
    pub fn requests(&mut self) -> Vec<RecordedRequest> {
        let mut requests = Vec::new();
        while let Ok(Some(request)) = self.requests_rx.try_next() {
            requests.push(request);
        }
        requests
    }
}

impl Drop for HttpOrigin {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}
