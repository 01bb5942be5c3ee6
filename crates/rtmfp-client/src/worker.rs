//! UDP driver: one worker thread running every link of the library
//!
//! The worker owns a current-thread tokio runtime. Each connection handle
//! gets its own UDP socket, bound once the server name is resolved, and a
//! [`Link`] holding its protocol state. Commands arrive over an unbounded
//! channel; a 50 ms ticker drives retransmissions and keepalives.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rtmfp_transport::{
    TransportError, TransportEvent, TransportReceiver, TransportSender, UdpConfig, UdpTransport,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Parameters;
use crate::driver::{Command, Driver, EventSink};
use crate::error::{ClientError, Result};
use crate::handle::Handle;
use crate::link::{ConnectRequest, Link};

/// Timer resolution of the worker
pub const TICK: Duration = Duration::from_millis(50);

enum Control {
    Command(Command),
    Shutdown,
}

enum Input {
    Resolved {
        handle: Handle,
        result: std::result::Result<(UdpTransport, Vec<SocketAddr>), String>,
    },
    Datagram {
        handle: Handle,
        data: Bytes,
        from: SocketAddr,
    },
    SocketError {
        handle: Handle,
        message: String,
    },
}

/// Socket and protocol state of one handle
struct Endpoint {
    link: Link,
    sender: Option<Box<dyn TransportSender>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// [`Driver`] sending RTMFP over UDP
pub struct UdpDriver {
    parameters: Arc<RwLock<Parameters>>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UdpDriver {
    pub fn new(parameters: Arc<RwLock<Parameters>>) -> Self {
        Self {
            parameters,
            control: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }
}

impl Driver for UdpDriver {
    fn start(&self, sink: EventSink) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::from)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(sink, self.parameters.clone(), control_rx);
        let thread = thread::Builder::new()
            .name("rtmfp-worker".to_string())
            .spawn(move || runtime.block_on(worker.run()))
            .map_err(TransportError::from)?;
        *self.control.lock() = Some(control_tx);
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    fn execute(&self, command: Command) -> Result<()> {
        let control = self.control.lock();
        let tx = control.as_ref().ok_or(ClientError::Terminated)?;
        tx.send(Control::Command(command))
            .map_err(|_| ClientError::Terminated)
    }

    fn shutdown(&self) {
        if let Some(tx) = self.control.lock().take() {
            let _ = tx.send(Control::Shutdown);
        }
        if let Some(thread) = self.thread.lock().take() {
            // a callback running on the worker may end up here
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                error!("RTMFP worker panicked");
            }
        }
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    sink: EventSink,
    parameters: Arc<RwLock<Parameters>>,
    control: mpsc::UnboundedReceiver<Control>,
    input_tx: mpsc::UnboundedSender<Input>,
    input_rx: mpsc::UnboundedReceiver<Input>,
    endpoints: HashMap<Handle, Endpoint>,
}

impl Worker {
    fn new(
        sink: EventSink,
        parameters: Arc<RwLock<Parameters>>,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            sink,
            parameters,
            control,
            input_tx,
            input_rx,
            endpoints: HashMap::new(),
        }
    }

    async fn run(mut self) {
        info!("RTMFP worker started");
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(Control::Command(command)) => self.on_command(command),
                    Some(Control::Shutdown) | None => break,
                },
                Some(input) = self.input_rx.recv() => self.on_input(input),
                _ = ticker.tick() => {}
            }
            self.flush().await;
        }

        // say goodbye to every far end before the sockets go away
        let now = Instant::now();
        for endpoint in self.endpoints.values_mut() {
            endpoint.link.disconnect(now);
        }
        self.flush().await;
        info!("RTMFP worker stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                handle,
                url,
                swf_url,
                page_url,
                flash_ver,
            } => {
                let parameters = self.parameters.read().clone();
                let fallback_after = (parameters.timeout_fallback > 0)
                    .then(|| Duration::from_secs(parameters.timeout_fallback as u64));
                let task = tokio::spawn(resolve(
                    handle,
                    url.host().to_string(),
                    url.port(),
                    parameters.udp_config(),
                    self.input_tx.clone(),
                ));
                let request = ConnectRequest {
                    url,
                    swf_url,
                    page_url,
                    flash_ver,
                };
                let link = Link::new(handle, request, self.sink.clone(), fallback_after);
                self.endpoints.insert(
                    handle,
                    Endpoint {
                        link,
                        sender: None,
                        tasks: vec![task],
                    },
                );
            }
            command => {
                let handle = command.handle();
                match self.endpoints.get_mut(&handle) {
                    Some(endpoint) => endpoint.link.on_command(command, Instant::now()),
                    None => debug!("No link for connection {}, dropping {}", handle, command.name()),
                }
            }
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Resolved { handle, result } => {
                let Some(endpoint) = self.endpoints.get_mut(&handle) else {
                    return;
                };
                match result {
                    Ok((transport, addresses)) => {
                        let local = transport
                            .local_addr()
                            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                        let receiver = transport.start_receiver();
                        endpoint
                            .tasks
                            .push(tokio::spawn(forward(handle, receiver, self.input_tx.clone())));
                        endpoint.sender = Some(Box::new(transport));
                        endpoint.link.on_resolved(addresses, local);
                    }
                    Err(reason) => endpoint.link.on_setup_failed(&reason),
                }
            }
            Input::Datagram { handle, data, from } => {
                if let Some(endpoint) = self.endpoints.get_mut(&handle) {
                    endpoint.link.on_datagram(&data, from, Instant::now());
                }
            }
            Input::SocketError { handle, message } => {
                if let Some(endpoint) = self.endpoints.get_mut(&handle) {
                    endpoint.link.on_socket_error(&message);
                }
            }
        }
    }

    /// Poll every link and send what is due
    async fn flush(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        for (handle, endpoint) in self.endpoints.iter_mut() {
            let datagrams = endpoint.link.poll(now);
            if let Some(sender) = endpoint.sender.as_ref() {
                for datagram in datagrams {
                    if let Err(e) = sender.send_to(datagram.data, datagram.address).await {
                        endpoint.link.on_socket_error(&e.to_string());
                    }
                }
            }
            if endpoint.link.is_finished() {
                finished.push(*handle);
            }
        }
        for handle in finished {
            debug!("Releasing socket of connection {}", handle);
            self.endpoints.remove(&handle);
        }
    }
}

/// Resolve the server and bind a socket of the matching family
async fn resolve(
    handle: Handle,
    host: String,
    port: u16,
    config: UdpConfig,
    tx: mpsc::UnboundedSender<Input>,
) {
    let result = async {
        let addresses: Vec<SocketAddr> = lookup_host((host.as_str(), port)).await?.collect();
        let first = *addresses.first().ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no address", host),
            ))
        })?;
        let addresses: Vec<SocketAddr> = addresses
            .into_iter()
            .filter(|address| address.is_ipv4() == first.is_ipv4())
            .collect();
        let bind = if first.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let transport = UdpTransport::bind_with_config(bind, config).await?;
        Ok::<_, TransportError>((transport, addresses))
    }
    .await
    .map_err(|e| format!("{}:{}: {}", host, port, e));
    let _ = tx.send(Input::Resolved { handle, result });
}

/// Pump a receiver into the worker's input channel
async fn forward<R: TransportReceiver>(handle: Handle, mut receiver: R, tx: mpsc::UnboundedSender<Input>) {
    while let Some((event, from)) = receiver.recv().await {
        let input = match event {
            TransportEvent::Data(data) => Input::Datagram { handle, data, from },
            TransportEvent::Error(message) => Input::SocketError { handle, message },
        };
        if tx.send(input).is_err() {
            break;
        }
    }
}
