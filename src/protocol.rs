//! Serial protocol of the arm's servo controller board.
//!
//! Every outbound frame is laid out as
//!
//! ```text
//! 0xFF | 0xFC | length | type | payload.. | checksum
//! ```
//!
//! where `length` counts itself, the type byte, the payload and the checksum. The
//! checksum is `(offset + sum of every preceding byte) mod 256`; `offset` depends on the
//! command family (see [`ChecksumFamily`]). Replies use device id `0xFB` and a plain
//! `sum(length, type, payload) mod 256` checksum.
//!
//! Angles are mapped linearly onto raw servo positions through [`Calibration`].

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result, ValidationError};
use crate::motion::JointPose;

/// First byte of every frame.
pub const HEADER: u8 = 0xFF;
/// Device id stamped on outbound frames.
pub const DEVICE_ID: u8 = 0xFC;
/// Device id the board uses when replying.
pub const REPLY_DEVICE_ID: u8 = DEVICE_ID - 1;

/// Length byte the board expects on a `write_any` broadcast frame.
const BROADCAST_LENGTH: u8 = 0x07;

/// Function codes understood by the board.
pub mod func {
    pub const WRITE_SINGLE_BASE: u8 = 0x10;
    pub const WRITE_ANY_BROADCAST: u8 = 0x17;
    pub const WRITE_ANY: u8 = 0x19;
    pub const TORQUE: u8 = 0x1A;
    pub const WRITE_SIX: u8 = 0x1E;
    pub const READ_BASE: u8 = 0x30;
    pub const RGB: u8 = 0x02;
    pub const RESET: u8 = 0x05;
    pub const BUZZER: u8 = 0x06;
    pub const SERVO_REPLY: u8 = 0x0A;
}

/// Checksum base offset. The RGB family derives its offset from the device id while
/// every other command uses a constant; both paths are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumFamily {
    Standard,
    Rgb,
}

impl ChecksumFamily {
    pub fn offset(self, device_id: u8) -> u32 {
        match self {
            ChecksumFamily::Standard => 5,
            ChecksumFamily::Rgb => 257 - u32::from(device_id),
        }
    }
}

/// Checksum of an outbound frame given every byte before the checksum slot.
pub fn outbound_checksum(prefix: &[u8], family: ChecksumFamily, device_id: u8) -> u8 {
    let sum = prefix
        .iter()
        .fold(family.offset(device_id), |acc, b| acc + u32::from(*b));
    (sum % 256) as u8
}

/// Checksum of a reply frame: length, type and payload bytes only.
pub fn reply_checksum(length: u8, kind: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(u32::from(length) + u32::from(kind), |acc, b| acc + u32::from(*b));
    (sum % 256) as u8
}

/// One protocol frame without its header, length and checksum bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_id: u8,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Outbound command frame.
    pub fn command(kind: u8, payload: Vec<u8>) -> Self {
        Self {
            device_id: DEVICE_ID,
            kind,
            payload,
        }
    }

    pub fn length(&self) -> u8 {
        (self.payload.len() + 3) as u8
    }

    /// Serializes an outbound frame, checksum included.
    pub fn encode(&self, family: ChecksumFamily) -> Vec<u8> {
        self.encode_declaring(self.length(), family)
    }

    /// Serializes an outbound frame whose length byte is `length` regardless of the
    /// payload carried.
    pub fn encode_declaring(&self, length: u8, family: ChecksumFamily) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 5);
        bytes.extend_from_slice(&[HEADER, self.device_id, length, self.kind]);
        bytes.extend_from_slice(&self.payload);
        bytes.push(outbound_checksum(&bytes, family, self.device_id));
        bytes
    }

    /// Serializes a frame the way the board does when replying.
    pub fn encode_reply(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 5);
        bytes.extend_from_slice(&[HEADER, self.device_id, self.length(), self.kind]);
        bytes.extend_from_slice(&self.payload);
        bytes.push(reply_checksum(self.length(), self.kind, &self.payload));
        bytes
    }
}

/// Incremental decoder for reply frames.
///
/// Bytes are pushed as they arrive; [`FrameDecoder::next_frame`] yields complete
/// frames. A frame with a bad checksum is logged and dropped, and decoding resumes at
/// the next header byte, so a corrupted byte never surfaces as an error to the caller.
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

    /// Number of frames discarded because of checksum mismatches.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let start = self.buf.iter().position(|b| *b == HEADER)?;
            self.buf.drain(..start);

            if self.buf.len() < 3 {
                return None;
            }
            let device_id = self.buf[1];
            let length = self.buf[2];
            if device_id != REPLY_DEVICE_ID || length < 3 {
                self.buf.drain(..1);
                continue;
            }

            let total = 2 + usize::from(length);
            if self.buf.len() < total {
                return None;
            }

            let kind = self.buf[3];
            let payload = self.buf[4..total - 1].to_vec();
            let actual = self.buf[total - 1];

            match check_reply(length, kind, &payload, actual) {
                Ok(()) => {
                    self.buf.drain(..total);
                    return Some(Frame {
                        device_id,
                        kind,
                        payload,
                    });
                }
                Err(err) => {
                    warn!(%err, kind, length, "dropping reply frame");
                    self.dropped += 1;
                    self.buf.drain(..1);
                }
            }
        }
    }
}

fn check_reply(length: u8, kind: u8, payload: &[u8], actual: u8) -> Result<()> {
    let expected = reply_checksum(length, kind, payload);
    if expected == actual {
        Ok(())
    } else {
        Err(BridgeError::Checksum { expected, actual })
    }
}

/// Linear angle <-> raw position mapping for one joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointCalibration {
    pub raw_min: u16,
    pub raw_max: u16,
    pub angle_max: u16,
    /// Mounted reversed: the angle is flipped (`angle_max - angle`) before mapping.
    #[serde(default)]
    pub inverted: bool,
}

impl JointCalibration {
    pub const fn new(raw_min: u16, raw_max: u16, angle_max: u16, inverted: bool) -> Self {
        Self {
            raw_min,
            raw_max,
            angle_max,
            inverted,
        }
    }

    pub fn contains(&self, angle: u16) -> bool {
        angle <= self.angle_max
    }

    /// Caller guarantees `angle <= angle_max`.
    pub fn encode(&self, angle: u16) -> u16 {
        let angle = if self.inverted {
            self.angle_max - angle
        } else {
            angle
        };
        let span = f64::from(self.raw_max - self.raw_min);
        (span * f64::from(angle) / f64::from(self.angle_max) + f64::from(self.raw_min)).round()
            as u16
    }

    /// `None` when the raw value maps outside the joint's angle domain.
    pub fn decode(&self, raw: u16) -> Option<u16> {
        let span = f64::from(self.raw_max - self.raw_min);
        let angle =
            ((f64::from(raw) - f64::from(self.raw_min)) * f64::from(self.angle_max) / span).round();
        if angle < 0.0 || angle > f64::from(self.angle_max) {
            return None;
        }
        let angle = angle as u16;
        Some(if self.inverted {
            self.angle_max - angle
        } else {
            angle
        })
    }
}

/// Mapping used by `write_any` for servos beyond the six arm joints.
pub const GENERIC_SERVO: JointCalibration = JointCalibration::new(900, 3100, 180, false);

/// Calibration table for the six arm joints (index 0 is joint 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub joints: [JointCalibration; 6],
}

impl Default for Calibration {
    fn default() -> Self {
        let standard = JointCalibration::new(900, 3100, 180, false);
        let inverted = JointCalibration::new(900, 3100, 180, true);
        let wrist = JointCalibration::new(380, 3700, 270, false);
        Self {
            joints: [standard, inverted, inverted, inverted, wrist, standard],
        }
    }
}

impl Calibration {
    /// Calibration for joint `id` (1..=6).
    pub fn joint(&self, id: u8) -> Option<&JointCalibration> {
        if (1..=6).contains(&id) {
            Some(&self.joints[usize::from(id - 1)])
        } else {
            None
        }
    }
}

/// Anything the codec can talk through: a serial port, a socket, a test double.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Number of reply frames inspected while waiting for a servo position.
const READ_ATTEMPTS: usize = 4;

/// Encodes commands for the controller board and decodes its replies.
pub struct ArmCodec {
    transport: Box<dyn Transport>,
    calibration: Calibration,
    decoder: FrameDecoder,
}

impl std::fmt::Debug for ArmCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmCodec")
            .field("calibration", &self.calibration)
            .field("dropped_frames", &self.decoder.dropped())
            .finish()
    }
}

impl ArmCodec {
    pub fn new(transport: Box<dyn Transport>, calibration: Calibration) -> Self {
        Self {
            transport,
            calibration,
            decoder: FrameDecoder::new(),
        }
    }

    /// Opens the serial device the board is attached to.
    pub fn open_serial(
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
        calibration: Calibration,
    ) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| BridgeError::Transport(format!("open {path}: {e}")))?;
        debug!(path, baud_rate, "serial port opened");
        Ok(Self::new(Box::new(port), calibration))
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Frames dropped so far because of checksum mismatches.
    pub fn dropped_frames(&self) -> u64 {
        self.decoder.dropped()
    }

    fn send(&mut self, frame: &Frame, family: ChecksumFamily) -> Result<()> {
        self.send_bytes(&frame.encode(family))
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport
            .write_all(bytes)
            .and_then(|_| self.transport.flush())
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// Moves joint `id` (1..=6) to `angle`. Id 0 moves every joint to the same angle.
    pub fn write_single(&mut self, id: u8, angle: u16, time_ms: u16) -> Result<()> {
        if id == 0 {
            return self.write_six(&JointPose::new([angle; 6]), time_ms);
        }
        let joint = *self
            .calibration
            .joint(id)
            .ok_or(ValidationError::InvalidSid)?;
        if !joint.contains(angle) {
            return Err(ValidationError::AngleOutOfRange {
                joint: id,
                angle: i32::from(angle),
            }
            .into());
        }
        let mut payload = raw_bytes(joint.encode(angle)).to_vec();
        payload.extend_from_slice(&time_bytes(time_ms));
        self.send(
            &Frame::command(func::WRITE_SINGLE_BASE + id, payload),
            ChecksumFamily::Standard,
        )
    }

    /// Moves all six joints in one frame.
    pub fn write_six(&mut self, pose: &JointPose, time_ms: u16) -> Result<()> {
        pose.validate(&self.calibration)?;
        let mut payload = Vec::with_capacity(14);
        for (joint, angle) in self.calibration.joints.iter().zip(pose.angles()) {
            payload.extend_from_slice(&raw_bytes(joint.encode(angle)));
        }
        payload.extend_from_slice(&time_bytes(time_ms));
        self.send(
            &Frame::command(func::WRITE_SIX, payload),
            ChecksumFamily::Standard,
        )
    }

    /// Moves any bus servo (1..=250) using the generic 0..180 mapping; id 0 broadcasts.
    pub fn write_any(&mut self, id: u8, angle: u16, time_ms: u16) -> Result<()> {
        if id > 250 {
            return Err(ValidationError::InvalidSid.into());
        }
        if !GENERIC_SERVO.contains(angle) {
            return Err(ValidationError::AngleOutOfRange {
                joint: id,
                angle: i32::from(angle),
            }
            .into());
        }
        let mut payload = vec![id];
        payload.extend_from_slice(&raw_bytes(GENERIC_SERVO.encode(angle)));
        payload.extend_from_slice(&time_bytes(time_ms));
        if id == 0 {
            // The board expects the broadcast frame to declare 0x07 while carrying the id byte.
            let frame = Frame::command(func::WRITE_ANY_BROADCAST, payload);
            return self.send_bytes(
                &frame.encode_declaring(BROADCAST_LENGTH, ChecksumFamily::Standard),
            );
        }
        self.send(&Frame::command(func::WRITE_ANY, payload), ChecksumFamily::Standard)
    }

    /// Reads the current angle of joint `id` (1..=6). `Ok(None)` when the board did not
    /// answer or answered with a position outside the joint's domain.
    pub fn read_single(&mut self, id: u8) -> Result<Option<u16>> {
        let joint = *self
            .calibration
            .joint(id)
            .ok_or(ValidationError::InvalidSid)?;
        let request = func::READ_BASE + id;
        self.send(
            &Frame::command(request, Vec::new()),
            ChecksumFamily::Standard,
        )?;

        for _ in 0..READ_ATTEMPTS {
            let Some(frame) = self.read_frame()? else {
                return Ok(None);
            };
            if frame.kind != func::SERVO_REPLY || frame.payload.len() < 3 {
                continue;
            }
            if frame.payload[2] != request {
                continue;
            }
            let raw = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
            if raw == 0 {
                return Ok(None);
            }
            return Ok(joint.decode(raw));
        }
        Ok(None)
    }

    /// Reads all six joints. A joint that fails to read is reported as `None`.
    pub fn read_all(&mut self) -> Result<[Option<u16>; 6]> {
        let mut angles = [None; 6];
        for (idx, slot) in angles.iter_mut().enumerate() {
            *slot = self.read_single(idx as u8 + 1)?;
        }
        Ok(angles)
    }

    pub fn set_torque(&mut self, on: bool) -> Result<()> {
        self.send(
            &Frame::command(func::TORQUE, vec![u8::from(on)]),
            ChecksumFamily::Standard,
        )
    }

    pub fn set_led_rgb(&mut self, red: u8, green: u8, blue: u8) -> Result<()> {
        self.send(
            &Frame::command(func::RGB, vec![red, green, blue]),
            ChecksumFamily::Rgb,
        )
    }

    /// Turns the buzzer on (continuous) or off.
    pub fn buzzer(&mut self, on: bool) -> Result<()> {
        let delay = if on { 0xFF } else { 0x00 };
        self.send(
            &Frame::command(func::BUZZER, vec![delay]),
            ChecksumFamily::Standard,
        )
    }

    /// Restarts the driver board.
    pub fn reset(&mut self) -> Result<()> {
        self.send(
            &Frame::command(func::RESET, vec![0x01]),
            ChecksumFamily::Standard,
        )
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(frame));
            }
            match self.transport.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.decoder.push(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(None)
                }
                Err(e) => return Err(BridgeError::Transport(e.to_string())),
            }
        }
    }
}

fn raw_bytes(raw: u16) -> [u8; 2] {
    raw.to_be_bytes()
}

fn time_bytes(time_ms: u16) -> [u8; 2] {
    time_ms.to_be_bytes()
}
