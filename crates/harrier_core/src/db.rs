use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread;

use log::{error, info};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use harrier_dsp::collar::Collar;

use crate::events::{Event, Post};
use crate::status::unix_now;

/// Current schema version.
const VERSION: i64 = 3;
/// Maximum number of rows kept in the Log table.
pub const LOG_SIZE: i64 = 500;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScanRow {
    pub time_stamp: i64,
    pub freq: f64,
    pub survey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignalRow {
    pub time_stamp: i64,
    pub freq: f64,
    #[serde(rename = "Mod")]
    pub modulation: i64,
    pub rate: f64,
    pub level: f64,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogRow {
    pub time_stamp: i64,
    pub message: String,
}

enum Request {
    AddSignal {
        timestamp: i64,
        collar: Collar,
        frequency: f64,
        survey: String,
    },
    AddLog {
        timestamp: i64,
        message: String,
    },
    GetScans(Box<dyn FnOnce(Vec<ScanRow>) + Send>),
    GetSignals(Box<dyn FnOnce(Vec<SignalRow>) + Send>),
    GetLog(Box<dyn FnOnce(Vec<LogRow>) + Send>),
    Close,
}

/// Cloneable handle onto the database writer thread.
///
/// All operations are messages; reads come back through callbacks run on
/// the writer thread. The writer is the only code that ever touches the
/// connection.
#[derive(Clone)]
pub struct DbHandle {
    tx: Sender<Request>,
    path: PathBuf,
}

impl DbHandle {
    /// Queues a signal append. The `Scans` parent row for the capture is
    /// inserted on demand.
    pub fn append_signal(&self, timestamp: i64, collar: Collar, frequency: f64, survey: &str) {
        let _ = self.tx.send(Request::AddSignal {
            timestamp,
            collar,
            frequency,
            survey: survey.to_string(),
        });
    }

    /// Queues a log append and returns the timestamp the entry will carry.
    pub fn append_log(&self, message: &str) -> i64 {
        let timestamp = unix_now();
        let _ = self.tx.send(Request::AddLog {
            timestamp,
            message: message.to_string(),
        });
        timestamp
    }

    pub fn scans(&self, callback: impl FnOnce(Vec<ScanRow>) + Send + 'static) {
        let _ = self.tx.send(Request::GetScans(Box::new(callback)));
    }

    pub fn signals(&self, callback: impl FnOnce(Vec<SignalRow>) + Send + 'static) {
        let _ = self.tx.send(Request::GetSignals(Box::new(callback)));
    }

    pub fn log(&self, callback: impl FnOnce(Vec<LogRow>) + Send + 'static) {
        let _ = self.tx.send(Request::GetLog(Box::new(callback)));
    }

    /// Size of the database file on disk.
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Owns the writer thread. Dropping without [`Database::close`] leaves
/// queued work unflushed, so the orchestrator closes explicitly.
pub struct Database {
    handle: DbHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Database {
    /// Opens (creating or migrating as needed) the database and starts the
    /// writer thread. A database that cannot be created or migrated is
    /// fatal and reported through `notify`.
    pub fn open(path: &Path, notify: Post) -> Self {
        if path.exists() {
            info!("Appending: {}", path.display());
        } else {
            info!("Creating: {}", path.display());
        }

        let (tx, rx) = mpsc::channel::<Request>();
        let thread_path = path.to_path_buf();
        let thread = thread::Builder::new()
            .name("database".to_string())
            .spawn(move || {
                let mut connection = match connect(&thread_path) {
                    Ok(connection) => connection,
                    Err(e) => {
                        notify.send(Event::Error(format!("Database error: {e}")));
                        return;
                    }
                };

                while let Ok(request) = rx.recv() {
                    match request {
                        Request::AddSignal {
                            timestamp,
                            collar,
                            frequency,
                            survey,
                        } => {
                            if let Err(e) =
                                add_signal(&mut connection, timestamp, &collar, frequency, &survey)
                            {
                                error!("signal insert failed: {e}");
                            }
                        }
                        Request::AddLog { timestamp, message } => {
                            if let Err(e) = add_log(&connection, timestamp, &message) {
                                error!("log insert failed: {e}");
                            }
                        }
                        Request::GetScans(callback) => callback(get_scans(&connection)),
                        Request::GetSignals(callback) => callback(get_signals(&connection)),
                        Request::GetLog(callback) => callback(get_log(&connection)),
                        Request::Close => break,
                    }
                }
            })
            .expect("spawning the database thread cannot fail");

        Self {
            handle: DbHandle {
                tx,
                path: path.to_path_buf(),
            },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> DbHandle {
        self.handle.clone()
    }

    /// Drains queued work and closes the connection.
    pub fn close(mut self) {
        let _ = self.handle.tx.send(Request::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Opens the connection and brings the schema to the current version.
fn connect(path: &Path) -> Result<Connection, DbError> {
    let mut connection = Connection::open(path)?;
    create_database(&mut connection)?;
    Ok(connection)
}

fn create_database(connection: &mut Connection) -> Result<(), DbError> {
    // auto_vacuum must be set before the first table exists
    connection.execute_batch(
        "pragma foreign_keys = 1;
         pragma auto_vacuum = incremental;",
    )?;

    let exists: bool = connection.query_row(
        "select count(*) from sqlite_master where type = 'table' and name = 'Info'",
        [],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;

    if exists {
        upgrade(connection)?;
    } else {
        create_tables(connection)?;
    }
    Ok(())
}

fn create_tables(connection: &Connection) -> Result<(), DbError> {
    connection.execute_batch(&format!(
        "create table if not exists Info (
             Key text primary key,
             Value integer);
         insert into Info values ('DbVersion', {VERSION});
         create table if not exists Scans (
             TimeStamp integer primary key,
             Freq real,
             Survey text);
         create table if not exists Signals (
             Id integer primary key autoincrement,
             TimeStamp integer,
             Freq real,
             Mod integer,
             Rate real,
             Level real,
             Lon real,
             Lat real,
             foreign key (TimeStamp) references Scans (TimeStamp)
                 on delete cascade);
         {LOG_TABLE}
         {}",
        log_trigger()
    ))?;
    Ok(())
}

const LOG_TABLE: &str = "create table if not exists Log (
    Id integer primary key autoincrement,
    TimeStamp integer,
    Message);";

/// Keeps the newest [`LOG_SIZE`] rows whenever an insert pushes the count over.
fn log_trigger() -> String {
    format!(
        "create trigger if not exists LogPrune after insert on Log
         when (select count(*) from Log) > {LOG_SIZE}
         begin
             delete from Log where Log.Id not in
                 (select Log.Id from Log order by Id desc limit {LOG_SIZE});
         end;"
    )
}

fn upgrade(connection: &mut Connection) -> Result<(), DbError> {
    let version: i64 = connection.query_row(
        "select Value from Info where Key = 'DbVersion'",
        [],
        |row| row.get(0),
    )?;

    if version == 1 {
        upgrade_1_to_2(connection)?;
    }
    if version <= 2 {
        upgrade_2_to_3(connection)?;
    }

    // Databases from before the prune trigger pick it up here
    connection.execute_batch(&log_trigger())?;
    Ok(())
}

fn upgrade_1_to_2(connection: &Connection) -> Result<(), DbError> {
    connection.execute_batch(
        "alter table Scans add column Survey text;
         update Scans set Survey = 'Unspecified' where Survey is null;
         update Info set Value = 2 where Key = 'DbVersion';",
    )?;
    Ok(())
}

fn upgrade_2_to_3(connection: &Connection) -> Result<(), DbError> {
    connection.execute_batch(&format!(
        "drop trigger if exists LogPrune;
         alter table Log rename to Temp;
         {LOG_TABLE}
         insert into Log (Id, TimeStamp, Message)
             select Id, cast(TimeStamp as integer), Message from Temp;
         drop table Temp;
         update Info set Value = 3 where Key = 'DbVersion';"
    ))?;
    Ok(())
}

fn add_signal(
    connection: &mut Connection,
    timestamp: i64,
    collar: &Collar,
    frequency: f64,
    survey: &str,
) -> Result<(), DbError> {
    let tx = connection.transaction()?;

    // The parent row already exists for every collar after the first
    let result = tx.execute(
        "insert into Scans values (?1, ?2, ?3)",
        rusqlite::params![timestamp, frequency, survey],
    );
    if let Err(e) = result {
        if !is_constraint_violation(&e) {
            return Err(e.into());
        }
    }

    tx.execute(
        "insert into Signals values (null, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            timestamp,
            collar.frequency,
            collar.modulation.as_index(),
            collar.rate,
            collar.level as f64,
            collar.lon,
            collar.lat,
        ],
    )?;

    tx.commit()?;
    Ok(())
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn add_log(connection: &Connection, timestamp: i64, message: &str) -> Result<(), DbError> {
    connection.execute(
        "insert into Log values (null, ?1, ?2)",
        rusqlite::params![timestamp, message],
    )?;
    Ok(())
}

fn get_scans(connection: &Connection) -> Vec<ScanRow> {
    query_rows(connection, "select TimeStamp, Freq, Survey from Scans", |row| {
        Ok(ScanRow {
            time_stamp: row.get(0)?,
            freq: row.get(1)?,
            survey: row.get(2)?,
        })
    })
}

fn get_signals(connection: &Connection) -> Vec<SignalRow> {
    query_rows(
        connection,
        "select TimeStamp, Freq, Mod, Rate, Level, Lon, Lat from Signals",
        |row| {
            Ok(SignalRow {
                time_stamp: row.get(0)?,
                freq: row.get(1)?,
                modulation: row.get(2)?,
                rate: row.get(3)?,
                level: row.get(4)?,
                lon: row.get(5)?,
                lat: row.get(6)?,
            })
        },
    )
}

fn get_log(connection: &Connection) -> Vec<LogRow> {
    query_rows(connection, "select TimeStamp, Message from Log", |row| {
        Ok(LogRow {
            time_stamp: row.get(0)?,
            message: row.get(1)?,
        })
    })
}

fn query_rows<T>(
    connection: &Connection,
    sql: &str,
    map: impl FnMut(&rusqlite::Row) -> rusqlite::Result<T>,
) -> Vec<T> {
    let rows = || -> rusqlite::Result<Vec<T>> {
        let mut statement = connection.prepare(sql)?;
        let rows = statement.query_map([], map)?;
        rows.collect()
    }();

    match rows {
        Ok(rows) => rows,
        Err(e) => {
            error!("query failed: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harrier_dsp::collar::Modulation;

    fn collar(rate: f64) -> Collar {
        Collar {
            signal_index: 0,
            modulation: Modulation::Cw,
            frequency: 151_140_000.0,
            count: 4,
            rate,
            level: 0.8,
            width: 25.0,
            lon: Some(11.5),
            lat: Some(48.1),
        }
    }

    fn open_memory() -> Connection {
        let mut connection = Connection::open_in_memory().unwrap();
        create_database(&mut connection).unwrap();
        connection
    }

    fn version_of(connection: &Connection) -> i64 {
        connection
            .query_row("select Value from Info where Key = 'DbVersion'", [], |r| {
                r.get(0)
            })
            .unwrap()
    }

    #[test]
    fn fresh_database_is_current_version() {
        let connection = open_memory();
        assert_eq!(version_of(&connection), VERSION);
    }

    #[test]
    fn signal_insert_creates_parent_scan() {
        let mut connection = open_memory();
        add_signal(&mut connection, 1000, &collar(60.0), 151.0, "survey").unwrap();
        add_signal(&mut connection, 1000, &collar(80.0), 151.0, "survey").unwrap();

        let scans = get_scans(&connection);
        assert_eq!(scans.len(), 1);
        assert_eq!(
            scans[0],
            ScanRow {
                time_stamp: 1000,
                freq: 151.0,
                survey: Some("survey".to_string()),
            }
        );

        let signals = get_signals(&connection);
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.time_stamp == 1000));
    }

    #[test]
    fn deleting_a_scan_cascades_to_signals() {
        let mut connection = open_memory();
        add_signal(&mut connection, 1000, &collar(60.0), 151.0, "survey").unwrap();
        connection
            .execute("delete from Scans where TimeStamp = 1000", [])
            .unwrap();
        assert!(get_signals(&connection).is_empty());
    }

    #[test]
    fn log_is_pruned_to_its_bound() {
        let connection = open_memory();
        for i in 0..LOG_SIZE + 20 {
            add_log(&connection, i, &format!("entry {i}")).unwrap();
        }
        let count: i64 = connection
            .query_row("select count(*) from Log", [], |r| r.get(0))
            .unwrap();
        assert!(count <= LOG_SIZE);

        // The survivors are the newest entries
        let log = get_log(&connection);
        assert_eq!(log.last().unwrap().time_stamp, LOG_SIZE + 19);
    }

    #[test]
    fn version_1_database_is_migrated() {
        let mut connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "create table Info (Key text primary key, Value integer);
                 insert into Info values ('DbVersion', 1);
                 create table Scans (TimeStamp integer primary key, Freq real);
                 create table Signals (
                     Id integer primary key autoincrement,
                     TimeStamp integer, Freq real, Mod integer, Rate real,
                     Level real, Lon real, Lat real);
                 create table Log (Id integer primary key autoincrement,
                     TimeStamp, Message);
                 insert into Scans values (500, 150.0);
                 insert into Log values (null, 123.0, 'old entry');",
            )
            .unwrap();

        create_database(&mut connection).unwrap();

        assert_eq!(version_of(&connection), 3);
        let scans = get_scans(&connection);
        assert_eq!(scans[0].survey, Some("Unspecified".to_string()));
        let log = get_log(&connection);
        assert_eq!(log[0].time_stamp, 123);
        assert_eq!(log[0].message, "old entry");
    }

    #[test]
    fn version_2_database_is_migrated() {
        let mut connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "create table Info (Key text primary key, Value integer);
                 insert into Info values ('DbVersion', 2);
                 create table Scans (TimeStamp integer primary key, Freq real, Survey text);
                 create table Signals (
                     Id integer primary key autoincrement,
                     TimeStamp integer, Freq real, Mod integer, Rate real,
                     Level real, Lon real, Lat real);
                 create table Log (Id integer primary key autoincrement,
                     TimeStamp, Message);
                 insert into Scans values (500, 150.0, 'field day');",
            )
            .unwrap();

        create_database(&mut connection).unwrap();

        assert_eq!(version_of(&connection), 3);
        assert_eq!(get_scans(&connection)[0].survey, Some("field day".to_string()));
    }

    #[test]
    fn reopening_keeps_rows() {
        let path = std::env::temp_dir().join(format!("harrier-db-test-{}.wfh", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut connection = Connection::open(&path).unwrap();
            create_database(&mut connection).unwrap();
            add_signal(&mut connection, 2000, &collar(40.0), 151.0, "s").unwrap();
        }
        {
            let mut connection = Connection::open(&path).unwrap();
            create_database(&mut connection).unwrap();
            assert_eq!(version_of(&connection), VERSION);
            assert_eq!(get_signals(&connection).len(), 1);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn writer_thread_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "harrier-db-thread-test-{}.wfh",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let (post, _rx) = crate::events::channel();
        let database = Database::open(&path, post);
        let handle = database.handle();

        handle.append_signal(3000, collar(60.0), 151.0, "survey");
        let (tx, rx) = std::sync::mpsc::channel();
        handle.signals(move |rows| {
            let _ = tx.send(rows);
        });
        let rows = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_stamp, 3000);

        database.close();
        let _ = std::fs::remove_file(&path);
    }
}
