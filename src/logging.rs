//! Remote log sink: duplicates formatted tracing output to one or two TCP
//! collectors (the host process tails them for its own log pipeline).

use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

use crate::error::Result;

/// A `MakeWriter` that fans every formatted log line out to the TCP
/// collectors it was connected to.
///
/// Clone is cheap and shares the underlying connections; collector write
/// errors are swallowed so logging never cascades failures into the
/// component that logged.
#[derive(Clone)]
pub struct TcpLogSink {
    collectors: Arc<Vec<Mutex<TcpStream>>>,
}

impl TcpLogSink {
    /// Dial `localhost:<port>` for each collector port.
    pub fn connect(ports: &[u16]) -> Result<Self> {
        let mut collectors = Vec::with_capacity(ports.len());
        for port in ports {
            let stream = TcpStream::connect(("127.0.0.1", *port))?;
            collectors.push(Mutex::new(stream));
        }
        Ok(Self {
            collectors: Arc::new(collectors),
        })
    }

    /// Install a default `tracing` subscriber that formats to this sink.
    ///
    /// Intended for hosts that want the crate's logs on their collectors
    /// without wiring tracing themselves. Safe to call when a global
    /// subscriber is already set (the existing one wins).
    pub fn install(self) {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(self)
            .try_init()
            .ok();
    }
}

pub struct SinkWriter {
    sink: TcpLogSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for collector in self.sink.collectors.iter() {
            let mut stream = collector.lock().unwrap_or_else(|e| e.into_inner());
            let _ = stream.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for collector in self.sink.collectors.iter() {
            let mut stream = collector.lock().unwrap_or_else(|e| e.into_inner());
            let _ = stream.flush();
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for TcpLogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter { sink: self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn fans_out_to_every_collector() {
        let listeners: Vec<TcpListener> = (0..2)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let ports: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();

        let sink = TcpLogSink::connect(&ports).unwrap();
        let mut writer = sink.make_writer();
        writer.write_all(b"hello collectors\n").unwrap();

        for listener in listeners {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello collectors\n");
        }
    }

    #[test]
    fn connect_fails_without_collector() {
        // Port 1 is never listening on loopback in the test environment.
        assert!(TcpLogSink::connect(&[1]).is_err());
    }
}
