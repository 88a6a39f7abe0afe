//! Frame traffic on the session's data channel.
//!
//! Inbound: [`ChannelDispatcher`] turns channel events into session events.
//! Outbound: [`send_frame`] and [`send_file`] refuse to write anything unless
//! the channel is open.

use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{SessionError, TransportError};
use crate::events::EventBus;
use crate::peer::transport::{ChannelEvent, DataChannel};
use crate::peer::types::ConnectionState;
use crate::protocol::{self, Frame};
use crate::transfer::{progress_percent, OutgoingFile, Reassembler};
use crate::utils::{now_millis, random_id};

/// Inbound side of the channel protocol. Owns the reassembler.
#[derive(Default)]
pub struct ChannelDispatcher {
    reassembler: Reassembler,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one channel event. Returns false once the channel has closed.
    pub fn on_event(&mut self, event: ChannelEvent, bus: &EventBus) -> bool {
        match event {
            ChannelEvent::Open => {
                log::info!("Data channel open");
                bus.report_connection(ConnectionState::Connected);
                true
            }
            ChannelEvent::Message(data) => {
                log::trace!("Received frame, length: {}", data.len());
                self.on_frame(&data, bus);
                true
            }
            ChannelEvent::Error(msg) => {
                log::warn!("Data channel error: {msg}");
                bus.error(TransportError::Channel(msg).into());
                true
            }
            ChannelEvent::Close => {
                log::info!("Data channel closed");
                self.reassembler.clear();
                bus.report_connection(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Decode and route one raw frame. Bad frames raise an error event and are
    /// otherwise dropped.
    pub fn on_frame(&mut self, data: &[u8], bus: &EventBus) {
        let frame = match protocol::decode(data) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Dropping unreadable frame: {e}");
                bus.error(SessionError::Parse(e));
                return;
            }
        };

        match frame {
            Frame::Message { payload, .. } => bus.message(protocol::payload_text(payload)),
            file_frame => match self.reassembler.accept(file_frame) {
                Ok(Some(file)) => bus.file(file),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Refusing file transfer: {e}");
                    bus.error(SessionError::Parse(e));
                }
            },
        }
    }

    pub fn in_flight(&self) -> usize {
        self.reassembler.in_flight()
    }

    pub fn reset(&mut self) {
        self.reassembler.clear();
    }
}

fn ensure_open(channel: &dyn DataChannel) -> Result<(), SessionError> {
    if channel.is_open() {
        Ok(())
    } else {
        Err(SessionError::ChannelNotOpen)
    }
}

/// Encode and send one frame. Nothing is written if the channel is not open.
pub async fn send_frame(channel: &dyn DataChannel, frame: &Frame) -> Result<(), SessionError> {
    ensure_open(channel)?;
    let text = protocol::encode(frame)?;
    channel.send_text(text).await?;
    Ok(())
}

pub async fn send_message(channel: &dyn DataChannel, payload: Value) -> Result<(), SessionError> {
    send_frame(channel, &Frame::message(payload, now_millis())).await
}

/// Send a whole file: `file_start`, paced chunks, `file_end`.
///
/// `on_progress` receives the rounded percentage after each chunk.
pub async fn send_file<F>(
    channel: &dyn DataChannel,
    file: &OutgoingFile,
    chunk_delay: Duration,
    mut on_progress: Option<F>,
) -> Result<(), SessionError>
where
    F: FnMut(u8) + Send,
{
    ensure_open(channel)?;

    let transfer_id = random_id();
    let total = file.total_chunks();
    log::info!(
        "Sending file {} ({} bytes, {total} chunks, transfer {transfer_id})",
        file.name,
        file.size()
    );

    send_frame(channel, &file.start_frame(&transfer_id, now_millis())).await?;

    for index in 0..total {
        send_frame(channel, &file.chunk_frame(index, &transfer_id)).await?;
        if let Some(cb) = on_progress.as_mut() {
            cb(progress_percent(index, total));
        }
        if !chunk_delay.is_zero() {
            sleep(chunk_delay).await;
        }
    }

    send_frame(channel, &file.end_frame(&transfer_id, now_millis())).await?;
    log::info!("File {} sent", file.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::events::SessionEvent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
        // Close after this many sends.
        close_after: Option<usize>,
    }

    impl Recorder {
        fn new(open: bool) -> Self {
            Self {
                open: AtomicBool::new(open),
                sent: Mutex::new(Vec::new()),
                close_after: None,
            }
        }
    }

    #[async_trait]
    impl DataChannel for Recorder {
        fn label(&self) -> &str {
            "messages"
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(text);
            if self.close_after == Some(sent.len()) {
                self.open.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn closed_channel_sends_nothing() {
        let ch = Recorder::new(false);
        let err = send_message(&ch, "hi".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelNotOpen));

        let file = OutgoingFile::new("f", "", vec![1u8; 100]);
        let err = send_file(&ch, &file, Duration::ZERO, None::<fn(u8)>).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelNotOpen));
        assert!(ch.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_is_framed_and_progress_reported() {
        let ch = Recorder::new(true);
        let file = OutgoingFile::new("f.bin", "application/x-test", vec![5u8; 40_000]);
        let mut progress: Vec<u8> = Vec::new();
        send_file(&ch, &file, Duration::ZERO, Some(|p: u8| progress.push(p)))
            .await
            .unwrap();

        assert_eq!(progress, vec![33, 67, 100]);
        let sent = ch.sent.lock().unwrap();
        assert_eq!(sent.len(), 5);
        let kinds: Vec<_> = sent
            .iter()
            .map(|s| protocol::decode(s.as_bytes()).unwrap().unwrap().kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["file_start", "file_chunk", "file_chunk", "file_chunk", "file_end"]
        );
    }

    #[tokio::test]
    async fn channel_closing_mid_transfer_stops_sending() {
        let ch = Recorder {
            close_after: Some(2),
            ..Recorder::new(true)
        };
        let file = OutgoingFile::new("f", "", vec![0u8; 100_000]);
        let err = send_file(&ch, &file, Duration::ZERO, None::<fn(u8)>).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelNotOpen));
        assert_eq!(ch.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sent_frames_reassemble_on_the_other_side() {
        let ch = Recorder::new(true);
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        let file = OutgoingFile::new("photo.jpg", "image/jpeg", data.clone());
        send_file(&ch, &file, Duration::ZERO, None::<fn(u8)>).await.unwrap();

        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let mut dispatcher = ChannelDispatcher::new();
        for text in ch.sent.lock().unwrap().iter() {
            dispatcher.on_event(ChannelEvent::Message(Bytes::from(text.clone())), &bus);
        }

        match events.try_recv() {
            Some(SessionEvent::File(f)) => {
                assert_eq!(f.name, "photo.jpg");
                assert_eq!(f.mime, "image/jpeg");
                assert_eq!(f.data.as_ref(), data.as_slice());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn malformed_frame_raises_parse_error_and_channel_stays_up() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let mut dispatcher = ChannelDispatcher::new();

        assert!(dispatcher.on_event(ChannelEvent::Message(Bytes::from_static(b"{oops")), &bus));
        assert!(matches!(
            events.try_recv(),
            Some(SessionEvent::Error(e)) if matches!(*e, SessionError::Parse(_))
        ));

        let ok = br#"{"type":"message","payload":"still here","timestamp":1}"#;
        dispatcher.on_event(ChannelEvent::Message(Bytes::from_static(ok)), &bus);
        assert!(matches!(events.try_recv(), Some(SessionEvent::Message(m)) if m == "still here"));
    }

    #[test]
    fn oversized_file_start_is_refused_and_channel_stays_up() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let mut dispatcher = ChannelDispatcher::new();

        let huge = br#"{"type":"file_start","fileName":"x","fileSize":18446744073709551615,"fileType":"","timestamp":1,"transferId":"t"}"#;
        assert!(dispatcher.on_event(ChannelEvent::Message(Bytes::from_static(huge)), &bus));
        assert!(matches!(
            events.try_recv(),
            Some(SessionEvent::Error(e))
                if matches!(*e, SessionError::Parse(ProtocolError::FileTooLarge { .. }))
        ));
        assert_eq!(dispatcher.in_flight(), 0);

        let ok = br#"{"type":"message","payload":"after","timestamp":2}"#;
        dispatcher.on_event(ChannelEvent::Message(Bytes::from_static(ok)), &bus);
        assert!(matches!(events.try_recv(), Some(SessionEvent::Message(m)) if m == "after"));

        let file = OutgoingFile::new("small.txt", "text/plain", b"fine".to_vec());
        for frame in [file.start_frame("s", 3), file.chunk_frame(0, "s")] {
            let text = protocol::encode(&frame).unwrap();
            dispatcher.on_frame(text.as_bytes(), &bus);
        }
        assert!(matches!(events.try_recv(), Some(SessionEvent::File(f)) if f.name == "small.txt"));
    }

    #[test]
    fn lifecycle_maps_to_connection_states() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let mut dispatcher = ChannelDispatcher::new();

        assert!(dispatcher.on_event(ChannelEvent::Open, &bus));
        assert!(!dispatcher.on_event(ChannelEvent::Close, &bus));

        assert!(matches!(
            events.try_recv(),
            Some(SessionEvent::ConnectionState(ConnectionState::Connected))
        ));
        assert!(matches!(
            events.try_recv(),
            Some(SessionEvent::ConnectionState(ConnectionState::Disconnected))
        ));
        assert!(matches!(events.try_recv(), Some(SessionEvent::Error(_))));
    }
}
