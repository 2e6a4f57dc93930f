//! In-memory stand-ins for the serial port used by unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{func, Calibration, Frame, HEADER, REPLY_DEVICE_ID};

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    pending: Vec<u8>,
    replies: VecDeque<u8>,
    servo_angles: [Option<u16>; 6],
    fail_writes: bool,
}

/// Records written frames and answers position reads from a configurable table.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    calibration: Calibration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_servo_angles(&self, angles: [Option<u16>; 6]) {
        self.state.lock().servo_angles = angles;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn clear(&self) {
        self.state.lock().written.clear();
    }

    /// Written bytes split back into outbound frames.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        split_frames(&self.written())
    }

    /// Outbound frames carrying the given function code.
    pub fn frames_of(&self, kind: u8) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter(|f| f.len() > 3 && f[3] == kind)
            .collect()
    }

    fn answer(&self, state: &mut MockState) {
        for frame in split_frames(&state.pending) {
            let kind = frame[3];
            if !(func::READ_BASE + 1..=func::READ_BASE + 6).contains(&kind) {
                continue;
            }
            let id = kind - func::READ_BASE;
            let Some(angle) = state.servo_angles[usize::from(id - 1)] else {
                continue;
            };
            let Some(joint) = self.calibration.joint(id) else {
                continue;
            };
            let raw = joint.encode(angle).to_be_bytes();
            let reply = Frame {
                device_id: REPLY_DEVICE_ID,
                kind: func::SERVO_REPLY,
                payload: vec![raw[0], raw[1], kind],
            };
            state.replies.extend(reply.encode_reply());
        }
        state.pending.clear();
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let mut n = 0;
        while n < buf.len() {
            match state.replies.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        state.written.extend_from_slice(buf);
        state.pending.extend_from_slice(buf);
        self.answer(&mut state);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn split_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i + 2 < bytes.len() {
        if bytes[i] != HEADER {
            i += 1;
            continue;
        }
        let total = 2 + usize::from(bytes[i + 2]);
        if i + total > bytes.len() {
            break;
        }
        frames.push(bytes[i..i + total].to_vec());
        i += total;
    }
    frames
}
