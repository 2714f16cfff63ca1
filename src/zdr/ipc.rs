//! The control-socket message codec.
//!
//! Records are self-delimited: a big-endian u32 length prefix followed by
//! that many bytes of JSON encoding `{ "cmd": ..., "args": [...] }`.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RspError};

/// Refuse absurd frames rather than allocating unbounded memory.
const MAX_MSG_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMsg {
    pub cmd: String,
    pub args: Vec<String>,
}

impl IpcMsg {
    pub fn new(cmd: &str, args: Vec<String>) -> Self {
        Self { cmd: cmd.to_string(), args }
    }
}

/// Write one message to `w`.
pub fn write_msg<W: Write>(w: &mut W, msg: &IpcMsg) -> Result<()> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| RspError::ZdrProtocol(format!("encode: {e}")))?;
    let len = payload.len() as u32;
    if len > MAX_MSG_LEN {
        return Err(RspError::ZdrProtocol("message too large".into()));
    }
    w.write_all(&len.to_be_bytes())
        .and_then(|()| w.write_all(&payload))
        .map_err(|e| RspError::ZdrProtocol(format!("write: {e}")))?;
    w.flush().map_err(|e| RspError::ZdrProtocol(format!("flush: {e}")))?;
    Ok(())
}

/// Read one message from `r`.
pub fn read_msg<R: Read>(r: &mut R) -> Result<IpcMsg> {
    let mut lenbuf = [0u8; 4];
    r.read_exact(&mut lenbuf)
        .map_err(|e| RspError::ZdrProtocol(format!("read: {e}")))?;
    let len = u32::from_be_bytes(lenbuf);
    if len > MAX_MSG_LEN {
        return Err(RspError::ZdrProtocol(format!("oversized message ({len} bytes)")));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .map_err(|e| RspError::ZdrProtocol(format!("read: {e}")))?;

    serde_json::from_slice(&payload)
        .map_err(|e| RspError::ZdrProtocol(format!("decode: {e}")))
}

/// Read one message, requiring a specific command.
pub fn read_expect<R: Read>(r: &mut R, cmd: &str) -> Result<IpcMsg> {
    let msg = read_msg(r)?;
    if msg.cmd != cmd {
        return Err(RspError::ZdrProtocol(format!(
            "unexpected ipc message {:?} (expected {cmd:?})",
            msg.cmd
        )));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip() {
        let msg = IpcMsg::new("fd-info", vec!["unix:/x.sock".into(), "tcp:127.0.0.1:8001".into()]);
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).unwrap();

        let got = read_msg(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn test_multiple_messages_self_delimit() {
        let a = IpcMsg::new("take-over", vec![]);
        let b = IpcMsg::new("fd-info", vec!["tcp:0.0.0.0:80".into()]);
        let mut buf = Vec::new();
        write_msg(&mut buf, &a).unwrap();
        write_msg(&mut buf, &b).unwrap();

        let mut cur = Cursor::new(&buf);
        assert_eq!(read_msg(&mut cur).unwrap(), a);
        assert_eq!(read_msg(&mut cur).unwrap(), b);
    }

    #[test]
    fn test_read_expect_rejects_unknown_command() {
        let mut buf = Vec::new();
        write_msg(&mut buf, &IpcMsg::new("bogus", vec![])).unwrap();
        let err = read_expect(&mut Cursor::new(&buf), "take-over").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_truncated_frame_is_protocol_error() {
        let mut buf = Vec::new();
        write_msg(&mut buf, &IpcMsg::new("take-over", vec![])).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_msg(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = Vec::from((MAX_MSG_LEN + 1).to_be_bytes());
        buf.extend_from_slice(b"xxxx");
        assert!(read_msg(&mut Cursor::new(&buf)).is_err());
    }
}
