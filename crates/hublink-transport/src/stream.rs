use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::LinkConfig;
use crate::error::TransportError;
use crate::reader::FrameReader;
use crate::traits::{LinkHandler, Transport};
use crate::writer::FrameWriter;

/// Outbound half of a byte-stream link.
///
/// Datagrams are written whole under a mutex so concurrent senders never
/// interleave. A write failure marks the link down; later sends are refused
/// until [`StreamLink::mark_up`] is called.
pub struct StreamLink<W> {
    writer: Mutex<FrameWriter<W>>,
    up: AtomicBool,
}

impl<W: Write + Send> StreamLink<W> {
    /// Create a link with default configuration.
    pub fn new(writer: W) -> Self {
        Self::with_config(writer, &LinkConfig::default())
    }

    /// Create a link with explicit configuration.
    pub fn with_config(writer: W, config: &LinkConfig) -> Self {
        Self {
            writer: Mutex::new(FrameWriter::new(writer, config.max_payload_size)),
            up: AtomicBool::new(true),
        }
    }

    /// Whether the last write succeeded.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Allow sends again after the stream was replaced or recovered.
    pub fn mark_up(&self) {
        self.up.store(true, Ordering::Release);
    }
}

impl<W: Write + Send> Transport for StreamLink<W> {
    fn send_frame(&self, frame: Bytes) -> bool {
        if !self.is_up() {
            return false;
        }

        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        match writer.send(&frame) {
            Ok(()) => true,
            Err(TransportError::PayloadTooLarge { size, max }) => {
                warn!(size, max, "refusing oversized datagram");
                false
            }
            Err(err) => {
                warn!(error = %err, "stream link write failed, marking link down");
                self.up.store(false, Ordering::Release);
                false
            }
        }
    }
}

/// Spawn the inbound half of a byte-stream link.
///
/// The thread reports link-up once, then every decoded datagram. End of
/// stream or a corrupt header is reported as a reset and ends the thread.
pub fn spawn_reader<R, H>(
    reader: R,
    config: &LinkConfig,
    handler: Arc<H>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    H: LinkHandler + ?Sized + 'static,
{
    let max_payload_size = config.max_payload_size;
    std::thread::Builder::new()
        .name(config.reader_thread_name.clone())
        .spawn(move || {
            let mut reader = FrameReader::new(reader, max_payload_size);
            handler.on_link_established();
            loop {
                match reader.read_frame() {
                    Ok(frame) => handler.on_frame_received(frame),
                    Err(TransportError::ConnectionClosed) => {
                        debug!("stream link closed by peer");
                        handler.on_reset_detected();
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, "stream link read failed");
                        handler.on_reset_detected();
                        return;
                    }
                }
            }
        })
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        Frame(Vec<u8>),
        Reset,
        Up,
    }

    struct ChannelHandler(Mutex<mpsc::Sender<Event>>);

    impl LinkHandler for ChannelHandler {
        fn on_frame_received(&self, frame: Bytes) {
            let _ = self.0.lock().unwrap().send(Event::Frame(frame.to_vec()));
        }

        fn on_reset_detected(&self) {
            let _ = self.0.lock().unwrap().send(Event::Reset);
        }

        fn on_link_established(&self) {
            let _ = self.0.lock().unwrap().send(Event::Up);
        }
    }

    #[test]
    fn datagrams_cross_a_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(ChannelHandler(Mutex::new(tx)));

        let reader = spawn_reader(right, &LinkConfig::default(), handler).unwrap();
        let link = StreamLink::new(left);

        assert!(link.send_frame(Bytes::from_static(b"ping")));
        assert!(link.send_frame(Bytes::from_static(b"pong")));

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Event::Up);
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            Event::Frame(b"ping".to_vec())
        );
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            Event::Frame(b"pong".to_vec())
        );

        drop(link);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Event::Reset);
        reader.join().unwrap();
    }

    #[test]
    fn oversized_datagram_is_refused_without_marking_down() {
        let (left, _right) = UnixStream::pair().unwrap();
        let config = LinkConfig {
            max_payload_size: 2,
            ..LinkConfig::default()
        };
        let link = StreamLink::with_config(left, &config);

        assert!(!link.send_frame(Bytes::from_static(b"too long")));
        assert!(link.is_up());
    }

    #[test]
    fn write_failure_marks_link_down() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(right);
        let link = StreamLink::new(left);

        // The first write after the peer hangs up fails with EPIPE.
        let mut sent = true;
        for _ in 0..4 {
            sent = link.send_frame(Bytes::from_static(b"lost"));
            if !sent {
                break;
            }
        }
        assert!(!sent);
        assert!(!link.is_up());

        link.mark_up();
        assert!(link.is_up());
    }
}
