//! Application payloads carried in MPDU bodies.
//!
//! Every payload starts with a one-byte frame type. Multi-byte fields are
//! little-endian. Encoded frames are zero-padded up to the requested size.

use thiserror::Error;
use wifi_ppdu::{RuType, StaId};
use wifisim_common::SimTime;

pub const FRAME_ECHO_REQUEST: u8 = 0x01;
pub const FRAME_ECHO_REPLY: u8 = 0x02;
pub const FRAME_TRIGGER: u8 = 0x10;
pub const FRAME_TB_DATA: u8 = 0x11;
pub const FRAME_DL_DATA: u8 = 0x20;

const RU_TYPES: [RuType; 7] = [
    RuType::Ru26,
    RuType::Ru52,
    RuType::Ru106,
    RuType::Ru242,
    RuType::Ru484,
    RuType::Ru996,
    RuType::Ru2x996,
];

/// Payload decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty payload")]
    Empty,

    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),

    #[error("frame type 0x{kind:02x} truncated at {len} bytes")]
    Truncated { kind: u8, len: usize },

    #[error("invalid RU type code {0}")]
    InvalidRu(u8),
}

/// One station's allocation announced by a trigger frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerUser {
    pub sta_id: StaId,
    pub ru_type: RuType,
    pub ru_index: u8,
    pub mcs: u8,
}

/// Decoded application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFrame {
    EchoRequest { seq: u16, sent_at: SimTime },
    EchoReply { seq: u16, sent_at: SimTime },
    /// Solicits HE TB PPDUs of `ul_length` (L-SIG length) from `users`,
    /// each carrying `tb_size` payload bytes.
    Trigger {
        ul_length: u16,
        channel_width: u16,
        tb_size: u16,
        users: Vec<TriggerUser>,
    },
    TbData { seq: u16 },
    DlData { seq: u16 },
}

impl AppFrame {
    pub fn kind(&self) -> u8 {
        match self {
            AppFrame::EchoRequest { .. } => FRAME_ECHO_REQUEST,
            AppFrame::EchoReply { .. } => FRAME_ECHO_REPLY,
            AppFrame::Trigger { .. } => FRAME_TRIGGER,
            AppFrame::TbData { .. } => FRAME_TB_DATA,
            AppFrame::DlData { .. } => FRAME_DL_DATA,
        }
    }

    /// Encodes the frame, padded with zeros to at least `size` bytes.
    pub fn encode(&self, size: usize) -> Vec<u8> {
        let mut buf = vec![self.kind()];
        match self {
            AppFrame::EchoRequest { seq, sent_at } | AppFrame::EchoReply { seq, sent_at } => {
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&sent_at.as_nanos().to_le_bytes());
            }
            AppFrame::Trigger {
                ul_length,
                channel_width,
                tb_size,
                users,
            } => {
                buf.extend_from_slice(&ul_length.to_le_bytes());
                buf.extend_from_slice(&channel_width.to_le_bytes());
                buf.extend_from_slice(&tb_size.to_le_bytes());
                buf.push(users.len() as u8);
                for user in users {
                    buf.extend_from_slice(&user.sta_id.to_le_bytes());
                    buf.push(user.ru_type as u8);
                    buf.push(user.ru_index);
                    buf.push(user.mcs);
                }
            }
            AppFrame::TbData { seq } | AppFrame::DlData { seq } => {
                buf.extend_from_slice(&seq.to_le_bytes());
            }
        }
        if buf.len() < size {
            buf.resize(size, 0);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let (&kind, body) = data.split_first().ok_or(FrameError::Empty)?;
        let mut r = Reader { kind, body, pos: 0 };
        match kind {
            FRAME_ECHO_REQUEST | FRAME_ECHO_REPLY => {
                let seq = r.u16()?;
                let sent_at = SimTime::from_nanos(r.u64()?);
                Ok(if kind == FRAME_ECHO_REQUEST {
                    AppFrame::EchoRequest { seq, sent_at }
                } else {
                    AppFrame::EchoReply { seq, sent_at }
                })
            }
            FRAME_TRIGGER => {
                let ul_length = r.u16()?;
                let channel_width = r.u16()?;
                let tb_size = r.u16()?;
                let count = r.u8()?;
                let mut users = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let sta_id = r.u16()?;
                    let code = r.u8()?;
                    let ru_type = *RU_TYPES.get(code as usize).ok_or(FrameError::InvalidRu(code))?;
                    users.push(TriggerUser {
                        sta_id,
                        ru_type,
                        ru_index: r.u8()?,
                        mcs: r.u8()?,
                    });
                }
                Ok(AppFrame::Trigger {
                    ul_length,
                    channel_width,
                    tb_size,
                    users,
                })
            }
            FRAME_TB_DATA => Ok(AppFrame::TbData { seq: r.u16()? }),
            FRAME_DL_DATA => Ok(AppFrame::DlData { seq: r.u16()? }),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

struct Reader<'a> {
    kind: u8,
    body: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let bytes = self
            .body
            .get(self.pos..self.pos + N)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or(FrameError::Truncated {
                kind: self.kind,
                len: self.body.len() + 1,
            })?;
        self.pos += N;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_padding() {
        let frame = AppFrame::EchoRequest {
            seq: 7,
            sent_at: SimTime::from_micros(1_500),
        };
        let bytes = frame.encode(100);
        assert_eq!(bytes.len(), 100);
        assert_eq!(bytes[0], FRAME_ECHO_REQUEST);
        assert_eq!(AppFrame::decode(&bytes).unwrap(), frame);

        // Requested size smaller than the frame itself.
        assert_eq!(frame.encode(0).len(), 11);
    }

    #[test]
    fn test_trigger_users() {
        let frame = AppFrame::Trigger {
            ul_length: 1234,
            channel_width: 40,
            tb_size: 300,
            users: vec![
                TriggerUser {
                    sta_id: 1,
                    ru_type: RuType::Ru106,
                    ru_index: 2,
                    mcs: 5,
                },
                TriggerUser {
                    sta_id: 9,
                    ru_type: RuType::Ru2x996,
                    ru_index: 1,
                    mcs: 0,
                },
            ],
        };
        assert_eq!(AppFrame::decode(&frame.encode(0)).unwrap(), frame);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(AppFrame::decode(&[]), Err(FrameError::Empty));
        assert_eq!(AppFrame::decode(&[0x7f, 0, 0]), Err(FrameError::UnknownType(0x7f)));
        assert_eq!(
            AppFrame::decode(&[FRAME_ECHO_REPLY, 1, 0, 3]),
            Err(FrameError::Truncated {
                kind: FRAME_ECHO_REPLY,
                len: 4
            })
        );
        assert_eq!(
            AppFrame::decode(&[FRAME_TRIGGER, 0, 0, 20, 0, 0, 0, 1, 1, 0, 9, 1, 0]),
            Err(FrameError::InvalidRu(9))
        );
    }
}
