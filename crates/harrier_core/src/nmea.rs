use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Signal report for one satellite in view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Satellite {
    /// Signal to noise ratio (dB-Hz) when the receiver reports one.
    #[serde(rename = "Level")]
    pub level: Option<u8>,
    /// Whether the satellite contributes to the fix.
    #[serde(rename = "Used")]
    pub used: bool,
}

/// Satellites keyed by PRN, rebuilt completely per GSV burst.
pub type SatelliteView = BTreeMap<u16, Satellite>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NmeaError {
    #[error("invalid checksum {actual}, should be {expected}")]
    Checksum { expected: String, actual: String },
    #[error("malformed {0} sentence")]
    Field(&'static str),
}

/// Updates pulled out of the NMEA stream.
#[derive(Debug, PartialEq)]
pub enum Update {
    /// A fix of quality 1 or 2, in decimal degrees.
    Location { lon: f64, lat: f64 },
    /// A completed satellite view.
    Satellites(SatelliteView),
    /// Nothing of interest (unknown sentence, partial GSV burst, no fix).
    None,
}

/// Incremental parser for the sentences the receiver cares about.
///
/// GSV satellite views span several sentences, so the parser keeps the
/// partial view between lines. Lines are expected without their trailing
/// `\r`; anything that is not `$<payload>*<checksum>` is ignored.
#[derive(Default)]
pub struct NmeaParser {
    sats: SatelliteView,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, line: &str) -> Result<Update, NmeaError> {
        let line = line.trim_matches(['\r', '\n']);
        let Some(payload) = line.strip_prefix('$') else {
            return Ok(Update::None);
        };
        let Some((payload, checksum)) = payload.split_once('*') else {
            return Ok(Update::None);
        };

        let computed = format!("{:02X}", xor_checksum(payload));
        if !checksum.eq_ignore_ascii_case(&computed) {
            return Err(NmeaError::Checksum {
                expected: computed,
                actual: checksum.to_string(),
            });
        }

        let fields: Vec<&str> = payload.split(',').collect();
        match fields[0] {
            "GPGGA" => global_fix(&fields),
            "GPGSV" => self.satellites(&fields),
            _ => Ok(Update::None),
        }
    }

    /// One message of a GSV burst. The view is cleared on the first message
    /// and reported once the last message has landed and the count agrees
    /// with the total-in-view field.
    fn satellites(&mut self, fields: &[&str]) -> Result<Update, NmeaError> {
        if fields.len() < 4 {
            return Err(NmeaError::Field("GPGSV"));
        }
        let total: usize = parse(fields[1], "GPGSV")?;
        let message: usize = parse(fields[2], "GPGSV")?;
        let in_view: usize = parse(fields[3], "GPGSV")?;

        if message == 1 {
            self.sats.clear();
        }

        let blocks = (fields.len() - 4) / 4;
        for block in 0..blocks {
            let prn: u16 = parse(fields[4 + block * 4], "GPGSV")?;
            let snr = fields[7 + block * 4];
            let satellite = if snr.is_empty() {
                Satellite {
                    level: None,
                    used: false,
                }
            } else {
                Satellite {
                    level: Some(parse(snr, "GPGSV")?),
                    used: true,
                }
            };
            self.sats.insert(prn, satellite);
        }

        if message == total && self.sats.len() == in_view {
            return Ok(Update::Satellites(self.sats.clone()));
        }
        Ok(Update::None)
    }
}

fn global_fix(fields: &[&str]) -> Result<Update, NmeaError> {
    if fields.len() < 7 {
        return Err(NmeaError::Field("GPGGA"));
    }
    // Only accept a GPS or differential fix
    if !matches!(fields[6], "1" | "2") {
        return Ok(Update::None);
    }

    let lat = coordinate(fields[2], fields[3]).ok_or(NmeaError::Field("GPGGA"))?;
    let lon = coordinate(fields[4], fields[5]).ok_or(NmeaError::Field("GPGGA"))?;
    Ok(Update::Location { lon, lat })
}

/// DDMM.mmmm / DDDMM.mmmm to decimal degrees. The position of the decimal
/// point tells latitude (two degree digits) from longitude (three).
fn coordinate(coord: &str, orientation: &str) -> Option<f64> {
    let degree_digits = match coord.find('.') {
        Some(4) => 2,
        Some(5) => 3,
        _ => return None,
    };
    let degrees: f64 = coord[..degree_digits].parse().ok()?;
    let minutes: f64 = coord[degree_digits..].parse().ok()?;
    let mut position = degrees + minutes / 60.0;
    if matches!(orientation, "S" | "W") {
        position = -position;
    }
    Some(position)
}

fn xor_checksum(payload: &str) -> u8 {
    payload.bytes().fold(0, |checksum, byte| checksum ^ byte)
}

fn parse<T: std::str::FromStr>(field: &str, sentence: &'static str) -> Result<T, NmeaError> {
    field.parse().map_err(|_| NmeaError::Field(sentence))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn gga_fix_in_decimal_degrees() {
        let update = NmeaParser::new().feed_line(GGA).unwrap();
        let Update::Location { lon, lat } = update else {
            panic!("expected a location, got {update:?}");
        };
        assert!((lon - 11.516_666_6).abs() < 1e-6);
        assert!((lat - 48.117_3).abs() < 1e-6);
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        // Flip one payload byte, keep the checksum
        let corrupted = GGA.replace("4807", "4808");
        let error = NmeaParser::new().feed_line(&corrupted).unwrap_err();
        assert!(matches!(error, NmeaError::Checksum { .. }));
    }

    #[test]
    fn no_fix_is_not_a_location() {
        // Quality 0 with a matching checksum
        let payload = "GPGGA,123519,4807.038,N,01131.000,E,0,08,0.9,545.4,M,46.9,M,,";
        let line = format!("${}*{:02X}", payload, xor_checksum(payload));
        assert_eq!(NmeaParser::new().feed_line(&line).unwrap(), Update::None);
    }

    #[test]
    fn southern_western_hemispheres_are_negative() {
        assert_eq!(coordinate("4807.038", "S"), Some(-(48.0 + 7.038 / 60.0)));
        assert_eq!(coordinate("01131.000", "W"), Some(-(11.0 + 31.0 / 60.0)));
        assert_eq!(coordinate("4807038", "N"), None);
    }

    #[test]
    fn gsv_burst_completes_on_last_message() {
        let first = "GPGSV,2,1,07,07,79,048,42,02,51,062,43,26,36,256,42,27,27,138,42";
        let second = "GPGSV,2,2,07,09,23,313,42,04,175,155,31,30,22,234,";
        let mut parser = NmeaParser::new();

        let line = format!("${}*{:02X}", first, xor_checksum(first));
        assert_eq!(parser.feed_line(&line).unwrap(), Update::None);

        let line = format!("${}*{:02X}", second, xor_checksum(second));
        let Update::Satellites(sats) = parser.feed_line(&line).unwrap() else {
            panic!("expected a completed view");
        };
        assert_eq!(sats.len(), 7);
        assert_eq!(
            sats[&7],
            Satellite {
                level: Some(42),
                used: true
            }
        );
        assert_eq!(
            sats[&30],
            Satellite {
                level: None,
                used: false
            }
        );
    }

    #[test]
    fn new_burst_replaces_the_view() {
        let burst = |prn: u16| {
            let payload = format!("GPGSV,1,1,01,{prn:02},79,048,42");
            format!("${}*{:02X}", payload, xor_checksum(&payload))
        };
        let mut parser = NmeaParser::new();
        parser.feed_line(&burst(7)).unwrap();
        let Update::Satellites(sats) = parser.feed_line(&burst(9)).unwrap() else {
            panic!("expected a completed view");
        };
        assert_eq!(sats.len(), 1);
        assert!(sats.contains_key(&9));
    }

    #[test]
    fn unknown_sentences_are_ignored() {
        let payload = "GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W";
        let line = format!("${}*{:02X}", payload, xor_checksum(payload));
        assert_eq!(NmeaParser::new().feed_line(&line).unwrap(), Update::None);
        assert_eq!(NmeaParser::new().feed_line("garbage").unwrap(), Update::None);
    }
}
