//! Single-client TCP control server.
//!
//! Accepts one viewer at a time on [`HARRIER_PORT`]; a new connection
//! displaces the old one. Inbound frames are `\n`-terminated JSON commands,
//! outbound frames replies and unsolicited pushes built by
//! `harrier_core::protocol`.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use harrier_core::db::DbHandle;
use harrier_core::events::{Event, Post};
use harrier_core::protocol::{
    self, parse_request, value_as_f64, Command, Method, Request, HARRIER_PORT,
};
use harrier_core::settings::Settings;
use harrier_core::status::Status;
use harrier_dsp::collar::Collar;

pub struct Server {
    shared: Arc<Shared>,
    status: Arc<Mutex<Status>>,
    database: DbHandle,
    cancel: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

struct Shared {
    client: Mutex<Option<TcpStream>>,
    post: Post,
}

impl Server {
    pub fn start(
        post: Post,
        status: Arc<Mutex<Status>>,
        settings: Arc<Mutex<Settings>>,
        database: DbHandle,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", HARRIER_PORT))?;
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared {
            client: Mutex::new(None),
            post,
        });
        let cancel = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new()
            .name("server".to_string())
            .spawn({
                let shared = shared.clone();
                let cancel = cancel.clone();
                let database = database.clone();
                move || serve(listener, shared, settings, database, cancel)
            })
            .expect("spawning the server thread cannot fail");

        Ok(Self {
            shared,
            status,
            database,
            cancel,
            thread: Some(thread),
        })
    }

    /// Writes a frame to the connected client, if any.
    pub fn send(&self, frame: &str) {
        self.shared.send(frame);
    }

    pub fn send_signals(&self, timestamp: i64, collars: &[Collar]) {
        let records: Vec<Value> = collars
            .iter()
            .map(|collar| protocol::signal_record(timestamp, collar))
            .collect();
        self.send(&protocol::result_ok(
            Method::Signals,
            Some(Value::from(records)),
        ));
    }

    pub fn send_status(&self) {
        let payload = {
            let status = self.status.lock().unwrap();
            status.payload(self.database.size())
        };
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.send(&protocol::result_named("Status", Some(value)));
    }

    pub fn send_satellites(&self) {
        let value = {
            let status = self.status.lock().unwrap();
            serde_json::to_value(status.satellites()).unwrap_or(Value::Null)
        };
        self.send(&protocol::result_named("Satellites", Some(value)));
    }

    pub fn send_log(&self, timestamp: i64, message: &str) {
        let records = Value::from(vec![protocol::log_record(timestamp, message)]);
        self.send(&protocol::result_named("Log", Some(records)));
    }

    /// Notifies the client and stops the listener.
    pub fn stop(mut self) {
        self.send(&protocol::result_named("Shutdown", None));
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Shared {
    fn send(&self, frame: &str) {
        let mut client = self.client.lock().unwrap();
        if let Some(stream) = client.as_mut() {
            if stream.write_all(frame.as_bytes()).is_err() {
                client.take();
            }
        }
    }

    /// Forgets the client; the reader notices on its own stream clone.
    fn disconnect(&self) {
        self.client.lock().unwrap().take();
    }
}

fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    settings: Arc<Mutex<Settings>>,
    database: DbHandle,
    cancel: Arc<AtomicBool>,
) {
    // The reader half is a clone of the client stream, so no lock is held
    // across the blocking read
    let mut reader: Option<TcpStream> = None;
    let mut pending = String::new();

    while !cancel.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
                let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
                pending.clear();
                reader = stream.try_clone().ok();

                {
                    // A new viewer displaces the old one
                    let mut client = shared.client.lock().unwrap();
                    *client = Some(stream);
                }
                shared.send(&protocol::result_connect());
                shared
                    .post
                    .send(Event::Info(format!("Connection from '{addr}'")));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("accept failed: {e}"),
        }

        let Some(stream) = reader.as_mut() else {
            thread::sleep(Duration::from_millis(50));
            continue;
        };

        let mut closed = false;
        let mut buffer = [0u8; 1024];
        match stream.read(&mut buffer) {
            Ok(0) => {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                shared.post.send(Event::Info(format!("'{peer}' disconnected")));
                closed = true;
            }
            Ok(length) => {
                pending.push_str(&String::from_utf8_lossy(&buffer[..length]));
                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    let line = line.trim();
                    if !line.is_empty() {
                        handle_line(line, &shared, &settings, &database);
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(_) => closed = true,
        }

        if closed {
            shared.disconnect();
            reader = None;
        }
    }
}

fn handle_line(
    line: &str,
    shared: &Arc<Shared>,
    settings: &Arc<Mutex<Settings>>,
    database: &DbHandle,
) {
    match parse_request(line) {
        Ok(request) => execute(request, shared, settings, database),
        Err(error) => shared.send(&protocol::result_error(&error)),
    }
}

/// Runs a validated request. Reads are answered from the database thread
/// through callbacks; sets go through the orchestrator as events.
fn execute(
    request: Request,
    shared: &Arc<Shared>,
    settings: &Arc<Mutex<Settings>>,
    database: &DbHandle,
) {
    match (request.command, request.method) {
        (Command::Run, Method::Scan) => {
            shared.post.send(Event::ScanStart);
        }
        (Command::Get, Method::Scans) => {
            let shared = shared.clone();
            database.scans(move |rows| {
                let value = serde_json::to_value(rows).unwrap_or(Value::Null);
                shared.send(&protocol::result_ok(Method::Scans, Some(value)));
            });
        }
        (Command::Get, Method::Signals) => {
            let shared = shared.clone();
            database.signals(move |rows| {
                let value = serde_json::to_value(rows).unwrap_or(Value::Null);
                shared.send(&protocol::result_ok(Method::Signals, Some(value)));
            });
        }
        (Command::Get, Method::Log) => {
            let shared = shared.clone();
            database.log(move |rows| {
                let value = serde_json::to_value(rows).unwrap_or(Value::Null);
                shared.send(&protocol::result_ok(Method::Log, Some(value)));
            });
        }
        (Command::Get, Method::Settings) => {
            let payload = settings.lock().unwrap().payload();
            let value = serde_json::to_value(payload).unwrap_or(Value::Null);
            shared.send(&protocol::result_ok(Method::Settings, Some(value)));
        }
        (Command::Set, Method::Delay) => {
            let delay = request.value.as_ref().and_then(value_as_f64);
            // Negative disables automatic rescanning
            let delay = delay.filter(|&d| d >= 0.0);
            shared.post.send(Event::SetDelay(delay));
            shared.send(&protocol::result_ok(Method::Delay, None));
        }
        (Command::Set, Method::Frequency) => {
            if let Some(frequency) = request.value.as_ref().and_then(value_as_f64) {
                shared.post.send(Event::SetFrequency(frequency));
            }
            shared.send(&protocol::result_ok(Method::Frequency, None));
        }
        (Command::Set, Method::Port) => {
            if let Some(port) = request.value.as_ref().and_then(Value::as_str) {
                shared.post.send(Event::SetGpsPort(port.to_string()));
            }
            shared.send(&protocol::result_ok(Method::Port, None));
        }
        (Command::Get, Method::Ports) => {
            let ports: Vec<String> = serialport::available_ports()
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.port_name)
                .collect();
            shared.send(&protocol::result_ok(Method::Ports, Some(Value::from(ports))));
        }
        // The method table rules everything else out at parse time
        _ => {}
    }
}
