mod gps;
mod receive;
mod sdr;
mod server;
mod testmode;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use harrier_core::constants::{GPS_AGE, GPS_RETRY};
use harrier_core::db::Database;
use harrier_core::events::{self, Event, Post};
use harrier_core::settings::{ConfigError, ConfigFile, Settings};
use harrier_core::status::{unix_now, ScanState, Status};
use harrier_dsp::constants::SAMPLE_RATE;

use gps::Gps;
use receive::Receive;
use server::Server;

#[derive(Parser, Debug)]
#[command(name = "harrier", about = "Wildlife collar tracking receiver")]
struct Args {
    /// Centre frequency (MHz)
    #[arg(short, long)]
    frequency: f64,
    /// Gain (dB)
    #[arg(short, long)]
    gain: Option<f64>,
    /// Configuration file
    #[arg(short, long)]
    conf: Option<PathBuf>,
    /// Survey name
    #[arg(short, long)]
    survey: Option<String>,
    /// Database file
    file: Option<PathBuf>,
    /// Test mode: one synthetic scan, results on stdout
    #[arg(short, long)]
    test: bool,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let conf_path = args.conf.clone().unwrap_or_else(|| home.join("harrier.conf"));

    let config = match ConfigFile::load(&conf_path) {
        Ok(config) => config,
        Err(e @ ConfigError::Missing(_)) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let settings = Settings {
        file: args.file.clone().unwrap_or_else(|| home.join("harrier.wfh")),
        freq: args.frequency,
        gain: args.gain.or(config.receiver.gain),
        delay: config.scan.delay,
        survey: args
            .survey
            .clone()
            .unwrap_or_else(|| format!("Survey {}", chrono::Local::now().format("%c"))),
        recv_index: config.receiver.index.unwrap_or(0),
        gps: config.gps,
        test: args.test,
    };

    println!("Harrier\n");

    if settings.test {
        return testmode::run(settings);
    }

    match Harrier::run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::from(3)
        }
    }
}

/// The orchestrator: one event loop over everything the threads post.
struct Harrier {
    post: Post,
    settings: Arc<Mutex<Settings>>,
    status: Arc<Mutex<Status>>,
    database: harrier_core::db::DbHandle,
    server: Server,
    receive: Receive,
    gps: Option<Gps>,
    cancel: Arc<AtomicBool>,
}

impl Harrier {
    fn run(settings: Settings) -> Result<(), String> {
        let (post, queue) = events::channel();

        println!("Survey:\t\t{}", settings.survey);
        let half_band = SAMPLE_RATE as f64 / 2e6;
        println!(
            "Scan range:\t{:.2}-{:.2}MHz",
            settings.freq - half_band,
            settings.freq + half_band
        );
        match settings.delay {
            Some(delay) => println!("Scan mode:\tAutomatic, after {delay}s"),
            None => println!("Scan mode:\tRemote"),
        }

        let auto_start = settings.delay.is_some();
        let database = Database::open(&settings.file, post.clone());
        let status = Arc::new(Mutex::new(Status::new()));
        let settings = Arc::new(Mutex::new(settings));

        let receive = Receive::start(settings.clone(), post.clone(), sdr::hardware_factory());
        let server = Server::start(
            post.clone(),
            status.clone(),
            settings.clone(),
            database.handle(),
        )
        .map_err(|e| format!("Could not start server: {e}"))?;

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let cancel = cancel.clone();
            let _ = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst));
        }

        let mut harrier = Harrier {
            post,
            settings,
            status,
            database: database.handle(),
            server,
            receive,
            gps: None,
            cancel,
        };

        harrier.post.send(Event::GpsOpen);
        if auto_start {
            harrier.post.send(Event::ScanStart);
        }

        let result = harrier.event_loop(queue);

        println!("\nExiting...");
        harrier.shutdown(database);
        result
    }

    fn event_loop(&mut self, queue: Receiver<Event>) -> Result<(), String> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            match queue.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    if let Some(fatal) = self.handle(event) {
                        return Err(fatal);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Handles one event; a returned message is fatal.
    fn handle(&mut self, event: Event) -> Option<String> {
        match event {
            Event::ScanStart => {
                let valid = self.status.lock().unwrap().fix_valid(GPS_AGE);
                if !valid {
                    self.set_state(ScanState::Wait);
                    self.post
                        .send_delayed(Event::ScanStart, Duration::from_secs(1));
                } else {
                    self.receive.receive();
                }
                self.server.send_status();
            }

            Event::ScanDone { mut collars, timestamp } => {
                let (freq, survey, delay) = {
                    let settings = self.settings.lock().unwrap();
                    (settings.freq, settings.survey.clone(), settings.delay)
                };
                let fix = {
                    let mut status = self.status.lock().unwrap();
                    status.set_signals(collars.len());
                    status.fix()
                };

                // Detections carry the fix current at completion, never the
                // one from scan start
                for collar in &mut collars {
                    if let Some(fix) = fix {
                        collar.lon = Some(fix.lon);
                        collar.lat = Some(fix.lat);
                    }
                    self.database
                        .append_signal(timestamp, collar.clone(), freq, &survey);
                }
                self.server.send_signals(timestamp, &collars);

                let message = format!("Found {} signals", collars.len());
                info!("{message}");
                let log_time = self.database.append_log(&message);
                self.server.send_log(log_time, &message);

                if let Some(delay) = delay {
                    self.post
                        .send_delayed(Event::ScanStart, Duration::from_secs_f64(delay));
                }
                self.server.send_status();
            }

            Event::GpsOpen => {
                if self.gps.is_none() {
                    info!("Starting GPS");
                    let config = self.settings.lock().unwrap().gps.clone();
                    self.gps = Some(Gps::start(config, self.post.clone()));
                }
            }

            Event::GpsLocation { lon, lat } => {
                self.status
                    .lock()
                    .unwrap()
                    .set_location(lon, lat, unix_now());
                self.print_status();
                self.server.send_status();
            }

            Event::GpsSatellites(sats) => {
                self.status.lock().unwrap().set_satellites(sats);
                self.print_status();
                self.server.send_satellites();
            }

            Event::GpsError(message) => {
                if let Some(gps) = self.gps.take() {
                    gps.stop();
                }
                let message = format!("GPS error: {message}");
                warn!("{message} (retry in {GPS_RETRY}s)");
                let log_time = self.database.append_log(&message);
                self.server.send_log(log_time, &message);

                self.status.lock().unwrap().clear_gps();
                self.server.send_status();
                self.post
                    .send_delayed(Event::GpsOpen, Duration::from_secs(GPS_RETRY));
            }

            Event::Status(state) => {
                self.set_state(state);
                self.server.send_status();
            }

            Event::SetDelay(delay) => {
                self.settings.lock().unwrap().delay = delay;
            }

            Event::SetFrequency(frequency) => {
                self.settings.lock().unwrap().freq = frequency;
            }

            Event::SetGpsPort(port) => {
                // Takes effect on the next GPS open
                self.settings.lock().unwrap().gps.port = port;
            }

            Event::Info(message) => {
                info!("{message}");
                let log_time = self.database.append_log(&message);
                self.server.send_log(log_time, &message);
            }

            Event::Warning(message) => {
                warn!("{message}");
                let log_time = self.database.append_log(&message);
                self.server.send_log(log_time, &message);
            }

            Event::Error(message) => {
                let log_time = self.database.append_log(&message);
                self.server.send_log(log_time, &message);
                return Some(message);
            }
        }
        None
    }

    fn set_state(&self, state: ScanState) {
        self.status.lock().unwrap().set_state(state);
        self.print_status();
    }

    fn print_status(&self) {
        let line = self.status.lock().unwrap().console_line();
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(line.as_bytes());
        let _ = stdout.flush();
    }

    fn shutdown(self, database: Database) {
        self.server.stop();
        if let Some(gps) = self.gps {
            gps.stop();
        }
        self.receive.stop();
        database.close();
    }
}
