// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Client-daemon protocol over Unix domain sockets.
//!
//! Messages are newline-delimited JSON. The client sends a [`Request`]
//! and the daemon replies with a [`Response`].

use crate::control::ProfileStatus;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Requests (CLI -> Daemon)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Request the current state of every profile.
    #[serde(rename = "get_status")]
    GetStatus,

    /// Reload the configuration from disk.
    #[serde(rename = "reload")]
    Reload,
}

// ---------------------------------------------------------------------------
// Responses (Daemon -> CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Current state of every running profile.
    #[serde(rename = "status")]
    Status { profiles: Vec<ProfileStatus> },

    /// Operation succeeded.
    #[serde(rename = "ok")]
    Ok { message: String },

    /// Operation failed.
    #[serde(rename = "error")]
    Error { message: String },
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Encode a message as a newline-delimited JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(msg)?;
    s.push('\n');
    Ok(s)
}

/// Decode a message from a JSON string (newline-trimmed).
pub fn decode<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(s.trim())
}

// ---------------------------------------------------------------------------
// Blocking client
// ---------------------------------------------------------------------------

/// A client connection to the daemon socket.
pub struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    pub fn send_request(&mut self, req: &Request) -> io::Result<Response> {
        let encoded = encode(req).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
        })?;
        self.stream.write_all(encoded.as_bytes())?;
        self.stream.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed the connection",
            ));
        }
        decode(&line).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ProfileState;
    use crate::hwmon::PwmRef;

    #[test]
    fn test_request_wire_format() {
        assert_eq!(encode(&Request::GetStatus).unwrap(), "{\"type\":\"get_status\"}\n");
        assert_eq!(decode::<Request>("{\"type\":\"reload\"}\n").unwrap(), Request::Reload);
        assert!(decode::<Request>("{\"type\":\"set_manual\"}").is_err());
    }

    #[test]
    fn test_status_response() {
        let resp = Response::Status {
            profiles: vec![ProfileStatus {
                pwm: PwmRef::new("hwmon2/pwm1"),
                name: Some("cpu".to_string()),
                state: ProfileState::Faulted,
                temp_c: None,
                duty: Some(100.0),
                fault: Some("failed to read hwmon1/temp1: gone".to_string()),
            }],
        };
        let line = encode(&resp).unwrap();
        assert!(line.contains("\"pwm\":\"hwmon2/pwm1\""));
        assert!(line.contains("\"state\":\"faulted\""));
        assert_eq!(decode::<Response>(&line).unwrap(), resp);
    }
}
