// Framed serial transport to the motor control board
//
// Packet format:
//   [0xFF, 0xFE, len_lo, len_hi, len_checksum, topic_lo, topic_hi, payload..., msg_checksum]
// len_checksum covers the two length bytes, msg_checksum covers topic + payload.
// Checksum = 255 - (sum % 256).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serialport::{self, SerialPort};
use tracing::{debug, info, warn};

use crate::messages::{MotorCommands, MotorStates, Record};

/// Sync bytes that start every frame
const SYNC: [u8; 2] = [0xFF, 0xFE];
const HEADER_LEN: usize = 7; // sync (2) + length (2) + length checksum (1) + topic (2)

/// Read timeout for the reader thread; a timeout just means no bytes yet
pub const READ_TIMEOUT_MS: u64 = 100;

/// Error types for motor board communication
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record on topic {topic}: expected {expected} bytes, got {got}")]
    RecordSize {
        topic: u16,
        expected: usize,
        got: usize,
    },

    #[error("Payload of {len} bytes does not fit in a frame")]
    PayloadTooLarge { len: usize },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// What the control loop needs from a transport
pub trait Transport {
    fn send<R: Record>(&mut self, record: &R) -> Result<()>;

    /// Latest record received on `R::TOPIC`, if any has arrived yet
    fn get_latest<R: Record>(&self) -> Option<R>;
}

/// Calculate checksum over a run of bytes
fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    255 - (sum % 256) as u8
}

/// Build a frame with sync bytes and both checksums
pub fn encode_frame(topic: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .map_err(|_| TransportError::PayloadTooLarge { len: payload.len() })?;
    let len_bytes = len.to_le_bytes();
    let topic_bytes = topic.to_le_bytes();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.extend_from_slice(&SYNC);
    frame.extend_from_slice(&len_bytes);
    frame.push(checksum(&len_bytes));
    frame.extend_from_slice(&topic_bytes);
    frame.extend_from_slice(payload);

    // Checksum over topic and payload
    frame.push(checksum(&frame[5..]));
    Ok(frame)
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub topic: u16,
    pub payload: Vec<u8>,
}

/// Incremental frame parser: feed it bytes as they arrive, pull out whole frames.
///
/// Garbage between frames and frames with bad checksums are skipped by
/// resynchronizing on the next sync sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    dropped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of corrupt frames discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Discard everything before the next sync sequence
            match self.buf.windows(2).position(|w| w == SYNC) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    // Keep a trailing 0xFF, it may be the first half of a sync
                    let keep = usize::from(self.buf.last() == Some(&SYNC[0]));
                    let cut = self.buf.len() - keep;
                    self.buf.drain(..cut);
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let len_bytes = [self.buf[2], self.buf[3]];
            if checksum(&len_bytes) != self.buf[4] {
                debug!("Bad length checksum, resyncing");
                self.resync();
                continue;
            }

            let len = u16::from_le_bytes(len_bytes) as usize;
            let total = HEADER_LEN + len + 1;
            if self.buf.len() < total {
                return None;
            }

            if checksum(&self.buf[5..total - 1]) != self.buf[total - 1] {
                debug!("Bad message checksum, resyncing");
                self.resync();
                continue;
            }

            let topic = u16::from_le_bytes([self.buf[5], self.buf[6]]);
            let payload = self.buf[HEADER_LEN..total - 1].to_vec();
            self.buf.drain(..total);
            return Some(Frame { topic, payload });
        }
    }

    // Skip past the current sync bytes so the search moves on
    fn resync(&mut self) {
        self.dropped += 1;
        self.buf.drain(..1);
    }
}

/// Latest payload per registered topic (last write wins).
///
/// The set of topics is fixed at construction; each slot is swapped
/// lock-free by the reader and loaded by the control loop.
#[derive(Debug, Default)]
pub struct TopicTable {
    slots: HashMap<u16, ArcSwapOption<Vec<u8>>>,
}

impl TopicTable {
    pub fn new(topics: &[u16]) -> Self {
        Self {
            slots: topics
                .iter()
                .map(|&topic| (topic, ArcSwapOption::empty()))
                .collect(),
        }
    }

    /// Table with the topics exchanged with the motor board
    pub fn motor_board() -> Self {
        Self::new(&[MotorCommands::TOPIC, MotorStates::TOPIC])
    }

    /// Store a payload; returns false if the topic is not registered
    pub fn store(&self, topic: u16, payload: Vec<u8>) -> bool {
        match self.slots.get(&topic) {
            Some(slot) => {
                slot.store(Some(Arc::new(payload)));
                true
            }
            None => false,
        }
    }

    pub fn latest(&self, topic: u16) -> Option<Arc<Vec<u8>>> {
        self.slots.get(&topic).and_then(|slot| slot.load_full())
    }

    pub fn latest_record<R: Record>(&self) -> Option<R> {
        let payload = self.latest(R::TOPIC)?;
        match R::decode(&payload) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Dropping malformed record: {}", e);
                None
            }
        }
    }
}

/// Serial link to the motor board.
///
/// Writes happen on the caller's thread; a background reader thread decodes
/// incoming frames into the shared topic table.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    topics: Arc<TopicTable>,
    _reader: JoinHandle<()>,
}

impl SerialTransport {
    /// Open the port and start the reader thread
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening motor board link on {} @ {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()?;
        let reader_port = port.try_clone()?;
        let topics = Arc::new(TopicTable::motor_board());

        let reader_topics = topics.clone();
        let reader = std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader_port, &reader_topics))?;

        Ok(Self {
            port,
            topics,
            _reader: reader,
        })
    }
}

impl Transport for SerialTransport {
    fn send<R: Record>(&mut self, record: &R) -> Result<()> {
        let frame = encode_frame(R::TOPIC, &record.encode())?;
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn get_latest<R: Record>(&self) -> Option<R> {
        self.topics.latest_record()
    }
}

/// Read bytes until the port fails, publishing every complete frame.
///
/// Runs for the life of the process.
pub fn read_loop<P: Read>(mut port: P, topics: &TopicTable) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 256];

    loop {
        match port.read(&mut chunk) {
            Ok(0) => {
                warn!("Serial port closed, reader exiting");
                return;
            }
            Ok(n) => decoder.push(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Serial read failed, reader exiting: {}", e);
                return;
            }
        }

        while let Some(frame) = decoder.next_frame() {
            if !topics.store(frame.topic, frame.payload) {
                debug!("Ignoring frame on unregistered topic {}", frame.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states_frame(psi_1: f32) -> Vec<u8> {
        let states = MotorStates {
            psi_1,
            ..Default::default()
        };
        encode_frame(MotorStates::TOPIC, &states.encode()).unwrap()
    }

    #[test]
    fn test_checksum() {
        // 255 - (1 + 2 + 3) = 249
        assert_eq!(checksum(&[1, 2, 3]), 249);
        // Wraps modulo 256: 255 - (300 % 256) = 211
        assert_eq!(checksum(&[200, 100]), 211);
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(101, &[0xAA, 0xBB]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 2 + 1);
        assert_eq!(&frame[0..2], &SYNC);
        assert_eq!(&frame[2..4], &[2, 0]); // length
        assert_eq!(frame[4], 253);
        assert_eq!(&frame[5..7], &[101, 0]); // topic
        assert_eq!(&frame[7..9], &[0xAA, 0xBB]);
        assert_eq!(frame[9], checksum(&[101, 0, 0xAA, 0xBB]));
    }

    #[test]
    fn test_decoder_handles_split_input_and_garbage() {
        let mut decoder = FrameDecoder::new();
        let frame = states_frame(1.5);

        decoder.push(&[0x00, 0x13, 0xFF]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&frame[..10]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&frame[10..]);

        let decoded = decoder.next_frame().unwrap();
        assert_eq!(decoded.topic, MotorStates::TOPIC);
        assert_eq!(MotorStates::decode(&decoded.payload).unwrap().psi_1, 1.5);
        assert_eq!(decoder.next_frame(), None);
    }

    #[test]
    fn test_decoder_skips_corrupt_frame() {
        let mut decoder = FrameDecoder::new();
        let mut bad = states_frame(1.0);
        let last = bad.len() - 1;
        bad[last] ^= 0x55;

        decoder.push(&bad);
        decoder.push(&states_frame(2.0));

        let frame = decoder.next_frame().unwrap();
        assert_eq!(MotorStates::decode(&frame.payload).unwrap().psi_1, 2.0);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn test_topic_table_last_write_wins() {
        let table = TopicTable::motor_board();
        assert_eq!(table.latest_record::<MotorStates>(), None);

        for psi in [1.0f32, 2.0, 3.0] {
            let states = MotorStates {
                psi_1: psi,
                ..Default::default()
            };
            assert!(table.store(MotorStates::TOPIC, states.encode()));
        }
        assert_eq!(table.latest_record::<MotorStates>().unwrap().psi_1, 3.0);
        assert!(!table.store(999, vec![1, 2, 3]));
    }

    #[test]
    fn test_read_loop_publishes_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&states_frame(0.25));
        stream.extend_from_slice(&encode_frame(999, &[1, 2]).unwrap());
        stream.extend_from_slice(&states_frame(0.5));

        let table = TopicTable::motor_board();
        // A byte slice reader ends with Ok(0), which ends the loop
        read_loop(stream.as_slice(), &table);
        assert_eq!(table.latest_record::<MotorStates>().unwrap().psi_1, 0.5);
        assert!(table.latest_record::<MotorCommands>().is_none());
    }
}
