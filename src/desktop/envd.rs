//! Wire format for the in-sandbox daemon's process API.
//!
//! The daemon speaks the Connect protocol. Server-streaming calls with the
//! JSON codec frame every message in a 5-byte envelope: one flag byte followed
//! by a big-endian `u32` payload length. The last frame of a response has the
//! end-of-stream flag set and carries an optional error instead of a message.

use super::traits::{CommandOutput, DesktopError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONTENT_TYPE: &str = "application/connect+json";
pub const START_PATH: &str = "/process.Process/Start";

const HEADER_LEN: usize = 5;
pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x02;

/// Single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

pub fn encode_envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reassembles envelopes from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete envelope, if one is buffered.
    pub fn next_envelope(&mut self) -> Option<Envelope> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        let flags = self.buf[0];
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Some(Envelope { flags, payload })
    }

    /// Bytes received that do not yet form a complete envelope.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StartRequest {
    pub process: ProcessConfig,
}

#[derive(Debug, Serialize)]
pub struct ProcessConfig {
    pub cmd: String,
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl StartRequest {
    /// Run `command` through a login bash shell.
    pub fn bash(command: &str, envs: BTreeMap<String, String>, cwd: Option<String>) -> Self {
        Self {
            process: ProcessConfig {
                cmd: "/bin/bash".into(),
                args: vec!["-l".into(), "-c".into(), command.into()],
                envs,
                cwd,
            },
        }
    }

    pub fn to_envelope(&self) -> Result<Vec<u8>, DesktopError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| DesktopError::Protocol(format!("encode start request: {e}")))?;
        Ok(encode_envelope(0, &json))
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    event: ProcessEvent,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessEvent {
    #[serde(default)]
    start: Option<StartEvent>,
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    #[serde(default)]
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    // Zero values are omitted from protobuf JSON.
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndStreamMessage {
    #[serde(default)]
    error: Option<ConnectError>,
}

#[derive(Debug, Deserialize)]
struct ConnectError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: Option<String>,
}

/// Folds a stream of response envelopes into a [`CommandOutput`].
#[derive(Debug, Default)]
pub struct ProcessCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    pid: Option<u32>,
    exit: Option<(i32, Option<String>)>,
}

impl ProcessCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Feed one envelope. Returns `true` once the stream is finished.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<bool, DesktopError> {
        if envelope.flags & FLAG_COMPRESSED != 0 {
            return Err(DesktopError::Protocol("compressed frames are not supported".into()));
        }

        if envelope.is_end_stream() {
            if envelope.payload.is_empty() {
                return Ok(true);
            }
            let end: EndStreamMessage = serde_json::from_slice(&envelope.payload)
                .map_err(|e| DesktopError::Protocol(format!("bad end-of-stream frame: {e}")))?;
            if let Some(err) = end.error {
                return Err(DesktopError::Rpc {
                    code: err.code,
                    message: err.message.unwrap_or_default(),
                });
            }
            return Ok(true);
        }

        let msg: StartResponse = serde_json::from_slice(&envelope.payload)
            .map_err(|e| DesktopError::Protocol(format!("bad process event: {e}")))?;
        let event = msg.event;

        if let Some(start) = event.start {
            self.pid = Some(start.pid);
        }
        if let Some(data) = event.data {
            if let Some(out) = data.stdout {
                self.stdout.extend(decode_chunk(&out)?);
            }
            if let Some(err) = data.stderr {
                self.stderr.extend(decode_chunk(&err)?);
            }
        }
        if let Some(end) = event.end {
            self.exit = Some((end.exit_code, end.error));
        }
        Ok(false)
    }

    /// Final result. A nonzero exit becomes [`DesktopError::CommandExit`].
    pub fn finish(self) -> Result<CommandOutput, DesktopError> {
        let Some((exit_code, error)) = self.exit else {
            return Err(DesktopError::Protocol(
                "stream ended before the process exited".into(),
            ));
        };

        let stdout = String::from_utf8_lossy(&self.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        if stderr.is_empty() {
            if let Some(error) = error {
                stderr = error;
            }
        }

        if exit_code != 0 {
            return Err(DesktopError::CommandExit { exit_code, stderr });
        }
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn decode_chunk(b64: &str) -> Result<Vec<u8>, DesktopError> {
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| DesktopError::Protocol(format!("bad base64 output chunk: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn frame(value: serde_json::Value) -> Envelope {
        Envelope {
            flags: 0,
            payload: serde_json::to_vec(&value).unwrap(),
        }
    }

    fn end_stream(value: Option<serde_json::Value>) -> Envelope {
        Envelope {
            flags: FLAG_END_STREAM,
            payload: value.map(|v| serde_json::to_vec(&v).unwrap()).unwrap_or_default(),
        }
    }

    #[test]
    fn envelope_header_is_flag_plus_big_endian_length() {
        let bytes = encode_envelope(FLAG_END_STREAM, b"{}");
        assert_eq!(bytes, vec![0x02, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn decoder_reassembles_split_frames() {
        let mut wire = encode_envelope(0, b"first");
        wire.extend(encode_envelope(FLAG_END_STREAM, b"second"));

        let mut decoder = EnvelopeDecoder::new();
        // Feed one byte at a time: frames must only pop when complete.
        let mut frames = Vec::new();
        for byte in &wire {
            decoder.push(std::slice::from_ref(byte));
            while let Some(env) = decoder.next_envelope() {
                frames.push(env);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"first");
        assert!(!frames[0].is_end_stream());
        assert_eq!(frames[1].payload, b"second");
        assert!(frames[1].is_end_stream());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_waits_for_full_payload() {
        let wire = encode_envelope(0, b"payload");
        let mut decoder = EnvelopeDecoder::new();
        decoder.push(&wire[..8]);
        assert!(decoder.next_envelope().is_none());
        assert_eq!(decoder.pending(), 8);
        decoder.push(&wire[8..]);
        assert_eq!(decoder.next_envelope().unwrap().payload, b"payload");
    }

    #[test]
    fn start_request_serializes_bash_invocation() {
        let mut envs = BTreeMap::new();
        envs.insert("DISPLAY".to_string(), ":0".to_string());
        let req = StartRequest::bash("echo hi", envs, None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["process"]["cmd"], "/bin/bash");
        assert_eq!(json["process"]["args"], json!(["-l", "-c", "echo hi"]));
        assert_eq!(json["process"]["envs"]["DISPLAY"], ":0");
        assert!(json["process"].get("cwd").is_none());

        let framed = req.to_envelope().unwrap();
        assert_eq!(framed[0], 0);
        let len = u32::from_be_bytes([framed[1], framed[2], framed[3], framed[4]]) as usize;
        assert_eq!(len, framed.len() - 5);
    }

    #[test]
    fn collector_gathers_output_until_exit() {
        let mut collector = ProcessCollector::new();
        assert!(!collector.apply(&frame(json!({"event": {"start": {"pid": 42}}}))).unwrap());
        assert!(!collector
            .apply(&frame(json!({"event": {"data": {"stdout": b64("hello ")}}})))
            .unwrap());
        assert!(!collector.apply(&frame(json!({"event": {"keepalive": {}}}))).unwrap());
        assert!(!collector
            .apply(&frame(json!({"event": {"data": {"stdout": b64("world\n")}}})))
            .unwrap());
        assert!(!collector
            .apply(&frame(json!({"event": {"end": {"exited": true, "status": "exit status 0"}}})))
            .unwrap());
        assert!(collector.apply(&end_stream(None)).unwrap());

        assert_eq!(collector.pid(), Some(42));
        let out = collector.finish().unwrap();
        assert_eq!(out.stdout, "hello world\n");
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn collector_reports_nonzero_exit_with_stderr() {
        let mut collector = ProcessCollector::new();
        collector
            .apply(&frame(json!({"event": {"data": {"stderr": b64("boom")}}})))
            .unwrap();
        collector
            .apply(&frame(json!({"event": {"end": {"exitCode": 2, "exited": true, "error": "exit status 2"}}})))
            .unwrap();
        collector.apply(&end_stream(Some(json!({})))).unwrap();

        match collector.finish() {
            Err(DesktopError::CommandExit { exit_code, stderr }) => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected CommandExit, got {other:?}"),
        }
    }

    #[test]
    fn collector_uses_end_error_when_stderr_is_empty() {
        let mut collector = ProcessCollector::new();
        collector
            .apply(&frame(json!({"event": {"end": {"exitCode": 1, "error": "signal: killed"}}})))
            .unwrap();
        match collector.finish() {
            Err(DesktopError::CommandExit { stderr, .. }) => assert_eq!(stderr, "signal: killed"),
            other => panic!("expected CommandExit, got {other:?}"),
        }
    }

    #[test]
    fn end_stream_error_is_surfaced() {
        let mut collector = ProcessCollector::new();
        let err = collector
            .apply(&end_stream(Some(json!({
                "error": {"code": "unauthenticated", "message": "invalid access token"}
            }))))
            .unwrap_err();
        assert!(err.to_string().contains("unauthenticated"));
        assert!(err.to_string().contains("invalid access token"));
        assert!(err.is_session_lost());
    }

    #[test]
    fn stream_without_end_event_is_a_protocol_error() {
        let mut collector = ProcessCollector::new();
        collector.apply(&end_stream(None)).unwrap();
        assert!(matches!(collector.finish(), Err(DesktopError::Protocol(_))));
    }

    #[test]
    fn compressed_frames_are_rejected() {
        let mut collector = ProcessCollector::new();
        let env = Envelope {
            flags: FLAG_COMPRESSED,
            payload: vec![1, 2, 3],
        };
        assert!(collector.apply(&env).is_err());
    }
}
