//! Graphite plaintext line protocol.
//!
//! One short-lived TCP connection per update carrying a single line:
//! `<dotted-key> <value> <unix-seconds>\n`.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{ForwardError, ForwardUpdate, Forwarder};

const SINK: &str = "graphite";

/// Format one line-protocol record.
pub fn format_line(key: &str, value: &str, timestamp: i64) -> String {
    format!("{key} {value} {timestamp}\n")
}

#[derive(Debug, Clone)]
pub struct GraphiteForwarder {
    host: String,
    port: u16,
    timeout: Duration,
}

impl GraphiteForwarder {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&self) -> Result<TcpStream, ForwardError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ForwardError::Resolve {
                sink: SINK,
                addr: self.addr(),
                source: e,
            })?;

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no addresses resolved",
        );
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(ForwardError::Connect {
            sink: SINK,
            addr: self.addr(),
            source: last_err,
        })
    }
}

impl Forwarder for GraphiteForwarder {
    fn name(&self) -> &'static str {
        SINK
    }

    fn forward(&self, update: &ForwardUpdate) -> Result<(), ForwardError> {
        let mut stream = self.connect()?;
        let write_err = |e| ForwardError::Write { sink: SINK, source: e };

        stream.set_write_timeout(Some(self.timeout)).map_err(write_err)?;
        let line = format_line(update.key.as_str(), &update.metric_value, update.timestamp);
        stream.write_all(line.as_bytes()).map_err(write_err)?;
        stream.flush().map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparcus_common::RequestPath;
    use std::io::Read;
    use std::net::TcpListener;

    fn update(value: &str) -> ForwardUpdate {
        let path = RequestPath::parse("Sensors/Temp").unwrap();
        ForwardUpdate {
            key: path.key(),
            path,
            metric_value: value.to_string(),
            raw_value: value.to_string(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_format_line() {
        assert_eq!(format_line("a.b", "21.5", 42), "a.b 21.5 42\n");
    }

    #[test]
    fn test_sends_one_line_per_update() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut received = String::new();
            conn.read_to_string(&mut received).unwrap();
            received
        });

        let forwarder = GraphiteForwarder::new("127.0.0.1", port, Duration::from_secs(2));
        forwarder.forward(&update("21.5")).unwrap();

        assert_eq!(reader.join().unwrap(), "sensors.temp 21.5 1700000000\n");
    }

    #[test]
    fn test_unreachable_sink_is_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let forwarder = GraphiteForwarder::new("127.0.0.1", port, Duration::from_millis(200));
        assert!(matches!(
            forwarder.forward(&update("1")),
            Err(ForwardError::Connect { .. })
        ));
    }
}
