use serde_json::{Map, Value};
use thiserror::Error;

use harrier_dsp::collar::Collar;

/// TCP port the control server listens on.
pub const HARRIER_PORT: u16 = 12883;
/// Protocol version sent in the connect handshake.
pub const VERSION: i64 = 1;

/// A request that failed to parse or validate. Never fatal; every variant
/// maps onto an error reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    Command(String),
    #[error("{0}")]
    Method(String),
    #[error("{0}")]
    Value(String),
}

impl ProtocolError {
    /// The `Type` field of the error reply.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Syntax(_) => "Syntax error",
            ProtocolError::Command(_) => "Command error",
            ProtocolError::Method(_) => "Method error",
            ProtocolError::Value(_) => "Value error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    Set,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Scan,
    Scans,
    Signals,
    Log,
    Settings,
    Delay,
    Frequency,
    Port,
    Ports,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Float,
    Text,
}

/// One row of the static method table: which commands a method permits and
/// what a `set` must carry.
struct MethodSpec {
    method: Method,
    name: &'static str,
    label: &'static str,
    can_get: bool,
    can_set: bool,
    can_run: bool,
    set_value: Option<ValueKind>,
}

const fn method(
    method: Method,
    name: &'static str,
    label: &'static str,
    can_get: bool,
    can_set: bool,
    can_run: bool,
    set_value: Option<ValueKind>,
) -> MethodSpec {
    MethodSpec {
        method,
        name,
        label,
        can_get,
        can_set,
        can_run,
        set_value,
    }
}

static METHODS: [MethodSpec; 9] = [
    method(Method::Scan, "scan", "Scan", false, false, true, None),
    method(Method::Scans, "scans", "Scans", true, false, false, None),
    method(Method::Signals, "signals", "Signals", true, false, false, None),
    method(Method::Log, "log", "Log", true, false, false, None),
    method(Method::Settings, "settings", "Settings", true, false, false, None),
    method(Method::Delay, "delay", "Delay", false, true, false, Some(ValueKind::Float)),
    method(Method::Frequency, "frequency", "Frequency", false, true, false, Some(ValueKind::Float)),
    method(Method::Port, "port", "Port", false, true, false, Some(ValueKind::Text)),
    method(Method::Ports, "ports", "Ports", true, false, false, None),
];

impl Method {
    fn spec(self) -> &'static MethodSpec {
        METHODS
            .iter()
            .find(|spec| spec.method == self)
            .expect("every method has a table row")
    }

    /// Capitalised name used in replies and pushes.
    pub fn label(self) -> &'static str {
        self.spec().label
    }
}

/// A validated inbound frame.
#[derive(Debug, PartialEq)]
pub struct Request {
    pub command: Command,
    pub method: Method,
    pub value: Option<Value>,
}

/// Parses and validates one `\n`-terminated frame. Keys and the command and
/// method names are case-folded; values are taken verbatim.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let frame: Value = serde_json::from_str(line)
        .map_err(|_| ProtocolError::Syntax("Expected a JSON string".to_string()))?;
    let object = frame
        .as_object()
        .ok_or_else(|| ProtocolError::Syntax("Expected a JSON object".to_string()))?;

    let command = match field(object, "command") {
        None => return Err(ProtocolError::Command("'Command' not found".to_string())),
        Some(value) => match value.as_str().map(str::to_ascii_lowercase).as_deref() {
            Some("get") => Command::Get,
            Some("set") => Command::Set,
            Some("run") => Command::Run,
            _ => {
                return Err(ProtocolError::Command(format!(
                    "Unknown command: {}",
                    plain(value)
                )))
            }
        },
    };

    let method = match field(object, "method") {
        None => return Err(ProtocolError::Method("'Method' not found".to_string())),
        Some(value) => {
            let name = value.as_str().map(str::to_ascii_lowercase);
            match METHODS
                .iter()
                .find(|spec| Some(spec.name) == name.as_deref())
            {
                Some(spec) => spec.method,
                None => {
                    return Err(ProtocolError::Method(format!(
                        "Unknown method: {}",
                        plain(value)
                    )))
                }
            }
        }
    };

    let value = field(object, "value").cloned();

    check_method(command, method)?;
    check_value(command, method, value.as_ref())?;

    Ok(Request {
        command,
        method,
        value,
    })
}

fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn check_method(command: Command, method: Method) -> Result<(), ProtocolError> {
    let spec = method.spec();
    match command {
        Command::Get if !spec.can_get => Err(ProtocolError::Method(format!(
            "'{}' is not readable",
            spec.name
        ))),
        Command::Set if !spec.can_set => Err(ProtocolError::Method(format!(
            "'{}' is not writable",
            spec.name
        ))),
        Command::Run if !spec.can_run => Err(ProtocolError::Method(format!(
            "'{}' cannot be run",
            spec.name
        ))),
        _ => Ok(()),
    }
}

fn check_value(command: Command, method: Method, value: Option<&Value>) -> Result<(), ProtocolError> {
    let spec = method.spec();
    match command {
        Command::Get => {
            if value.is_some() {
                return Err(ProtocolError::Value(format!(
                    "'{}' has an unexpected value",
                    spec.name
                )));
            }
        }
        Command::Set => {
            let Some(kind) = spec.set_value else {
                return Ok(());
            };
            let Some(value) = value else {
                return Err(ProtocolError::Value(format!(
                    "'{}' expects a value",
                    spec.name
                )));
            };
            match kind {
                ValueKind::Float if value_as_f64(value).is_none() => {
                    return Err(ProtocolError::Value("Expected a float".to_string()));
                }
                ValueKind::Text if !value.is_string() => {
                    return Err(ProtocolError::Value("Expected a string".to_string()));
                }
                _ => {}
            }
        }
        Command::Run => {}
    }
    Ok(())
}

/// Numbers and numeric strings are both acceptable floats.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `{Result: "OK", Method, Value?}` with the label capitalised.
pub fn result_ok(method: Method, value: Option<Value>) -> String {
    result_named(method.label(), value)
}

/// The same frame shape under an arbitrary label, used for unsolicited
/// pushes (`Status`, `Satellites`, `Shutdown`, ...).
pub fn result_named(label: &str, value: Option<Value>) -> String {
    let mut response = Map::new();
    response.insert("Result".to_string(), Value::from("OK"));
    response.insert("Method".to_string(), Value::from(label));
    if let Some(value) = value {
        response.insert("Value".to_string(), value);
    }
    frame(Value::Object(response))
}

/// The server half of the connection handshake.
pub fn result_connect() -> String {
    let mut response = Map::new();
    response.insert("Method".to_string(), Value::from("Connect"));
    response.insert("Result".to_string(), Value::from("OK"));
    response.insert("Application".to_string(), Value::from("Harrier"));
    response.insert("Version".to_string(), Value::from(VERSION));
    frame(Value::Object(response))
}

pub fn result_error(error: &ProtocolError) -> String {
    let mut response = Map::new();
    response.insert("Result".to_string(), Value::from("Error"));
    response.insert("Type".to_string(), Value::from(error.kind()));
    response.insert("Message".to_string(), Value::from(error.to_string()));
    frame(Value::Object(response))
}

/// A signal as pushed to the viewer and as listed by `get signals`.
pub fn signal_record(timestamp: i64, collar: &Collar) -> Value {
    let mut record = Map::new();
    record.insert("TimeStamp".to_string(), Value::from(timestamp));
    record.insert("Freq".to_string(), Value::from(collar.frequency));
    record.insert("Mod".to_string(), Value::from(collar.modulation.as_index()));
    record.insert("Rate".to_string(), Value::from(collar.rate));
    record.insert("Level".to_string(), Value::from(collar.level as f64));
    record.insert("Lon".to_string(), Value::from(collar.lon));
    record.insert("Lat".to_string(), Value::from(collar.lat));
    Value::Object(record)
}

pub fn log_record(timestamp: i64, message: &str) -> Value {
    let mut record = Map::new();
    record.insert("TimeStamp".to_string(), Value::from(timestamp));
    record.insert("Message".to_string(), Value::from(message));
    Value::Object(record)
}

fn frame(value: Value) -> String {
    let mut line = value.to_string();
    line.push_str("\r\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_scan_parses() {
        let request = parse_request(r#"{"command":"run","method":"scan"}"#).unwrap();
        assert_eq!(
            request,
            Request {
                command: Command::Run,
                method: Method::Scan,
                value: None
            }
        );
    }

    #[test]
    fn keys_and_names_are_case_folded() {
        let request = parse_request(r#"{"Command":"GET","Method":"Scans"}"#).unwrap();
        assert_eq!(request.command, Command::Get);
        assert_eq!(request.method, Method::Scans);
    }

    #[test]
    fn set_delay_accepts_negative_floats() {
        let request = parse_request(r#"{"command":"set","method":"delay","value":-1}"#).unwrap();
        assert_eq!(value_as_f64(request.value.as_ref().unwrap()), Some(-1.0));
    }

    #[test]
    fn malformed_json_is_a_syntax_error() {
        let error = parse_request("{command").unwrap_err();
        assert_eq!(error.kind(), "Syntax error");
    }

    #[test]
    fn missing_and_unknown_fields() {
        assert_eq!(
            parse_request(r#"{"method":"scan"}"#).unwrap_err().kind(),
            "Command error"
        );
        assert_eq!(
            parse_request(r#"{"command":"fly","method":"scan"}"#)
                .unwrap_err()
                .kind(),
            "Command error"
        );
        assert_eq!(
            parse_request(r#"{"command":"get"}"#).unwrap_err().kind(),
            "Method error"
        );
        assert_eq!(
            parse_request(r#"{"command":"get","method":"teleport"}"#)
                .unwrap_err()
                .kind(),
            "Method error"
        );
    }

    #[test]
    fn permissions_are_enforced() {
        let error = parse_request(r#"{"command":"set","method":"scans","value":1}"#).unwrap_err();
        assert_eq!(error, ProtocolError::Method("'scans' is not writable".to_string()));

        let error = parse_request(r#"{"command":"run","method":"log"}"#).unwrap_err();
        assert_eq!(error, ProtocolError::Method("'log' cannot be run".to_string()));
    }

    #[test]
    fn value_types_are_enforced() {
        let error = parse_request(r#"{"command":"set","method":"delay"}"#).unwrap_err();
        assert_eq!(error, ProtocolError::Value("'delay' expects a value".to_string()));

        let error =
            parse_request(r#"{"command":"set","method":"frequency","value":"fast"}"#).unwrap_err();
        assert_eq!(error, ProtocolError::Value("Expected a float".to_string()));

        let error = parse_request(r#"{"command":"get","method":"log","value":1}"#).unwrap_err();
        assert_eq!(error.kind(), "Value error");

        // Numeric strings pass the float check
        parse_request(r#"{"command":"set","method":"frequency","value":"151.2"}"#).unwrap();
    }

    #[test]
    fn replies_are_line_terminated_json() {
        let reply = result_ok(Method::Delay, None);
        assert_eq!(reply, "{\"Result\":\"OK\",\"Method\":\"Delay\"}\r\n");

        let connect = result_connect();
        assert!(connect.starts_with("{\"Method\":\"Connect\",\"Result\":\"OK\""));
        assert!(connect.contains("\"Application\":\"Harrier\""));
        assert!(connect.ends_with("\r\n"));
    }

    #[test]
    fn error_reply_carries_kind_and_message() {
        let error = ProtocolError::Value("Expected a float".to_string());
        let reply = result_error(&error);
        let parsed: Value = serde_json::from_str(reply.trim_end()).unwrap();
        assert_eq!(parsed["Result"], "Error");
        assert_eq!(parsed["Type"], "Value error");
        assert_eq!(parsed["Message"], "Expected a float");
    }

    #[test]
    fn request_round_trips_through_serialisation() {
        let original = r#"{"command":"set","method":"delay","value":30}"#;
        let request = parse_request(original).unwrap();
        let rebuilt = json!({
            "command": "set",
            "method": "delay",
            "value": request.value.clone(),
        });
        let reparsed = parse_request(&rebuilt.to_string()).unwrap();
        assert_eq!(request, reparsed);
    }
}
