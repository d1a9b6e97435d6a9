use std::io::{self, Read, Write};

// A frame larger than this is treated as a protocol violation. Shared
// files are read whole into memory, so the cap bounds that too.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const CLASS_REQUEST: u8 = 0;
const CLASS_REPLY: u8 = 1;

/// The seven request types of the protocol.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum RequestKind {
    Register = 0,
    Login = 1,
    Logout = 2,
    Search = 3,
    Acknowledge = 4,
    SimpleDownload = 5,
    CheckAlive = 6,
}

impl RequestKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RequestKind::Register),
            1 => Some(RequestKind::Login),
            2 => Some(RequestKind::Logout),
            3 => Some(RequestKind::Search),
            4 => Some(RequestKind::Acknowledge),
            5 => Some(RequestKind::SimpleDownload),
            6 => Some(RequestKind::CheckAlive),
            _ => None,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ReplyStatus {
    Success = 0,
    Failure = 1,
}

/// A request message: one of the seven types plus its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(kind: RequestKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: RequestKind) -> Self {
        Self {
            kind,
            payload: vec![],
        }
    }
}

/// A reply message: SUCCESS or FAILURE plus an optional payload.
///
/// A FAILURE reply never carries a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: ReplyStatus::Success,
            payload,
        }
    }

    pub fn success_empty() -> Self {
        Self::success(vec![])
    }

    pub fn failure() -> Self {
        Self {
            status: ReplyStatus::Failure,
            payload: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

/// Any fully framed message travelling on a connection. Both ends send
/// the same shape: a `u32` big-endian length, a class byte (request or
/// reply), a tag byte (kind or status) and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug)]
pub enum MessageError {
    ReadError(io::Error),
    WriteError(io::Error),
    /// The sender closed the connection before a full frame arrived.
    ConnectionClosed,
    FrameTooLong(u32),
    FrameTooShort,
    InvalidClass(u8),
    /// Request tag outside the protocol. The receiver must not reply.
    UnknownRequestKind(u8),
    InvalidReplyStatus(u8),
    /// A reply arrived where a request was expected, or the reverse.
    UnexpectedMessage,
}

impl Message {
    /// Converts the message to its framed byte representation.
    pub fn as_bytes(&self) -> Vec<u8> {
        let (class, tag, payload) = match self {
            Message::Request(request) => (CLASS_REQUEST, request.kind as u8, &request.payload),
            Message::Reply(reply) => (CLASS_REPLY, reply.status as u8, &reply.payload),
        };
        let length = (payload.len() + 2) as u32;
        let mut bytes = Vec::with_capacity(payload.len() + 6);
        bytes.extend(length.to_be_bytes());
        bytes.push(class);
        bytes.push(tag);
        bytes.extend(payload);
        bytes
    }

    /// Parses one frame (without its length prefix) into a `Message`.
    pub fn from_frame(frame: &[u8]) -> Result<Self, MessageError> {
        if frame.len() < 2 {
            return Err(MessageError::FrameTooShort);
        }
        let class = frame[0];
        let tag = frame[1];
        let payload = frame[2..].to_vec();
        match class {
            CLASS_REQUEST => {
                let kind =
                    RequestKind::from_tag(tag).ok_or(MessageError::UnknownRequestKind(tag))?;
                Ok(Message::Request(Request::new(kind, payload)))
            }
            CLASS_REPLY => {
                let status = match tag {
                    0 => ReplyStatus::Success,
                    1 => ReplyStatus::Failure,
                    _ => return Err(MessageError::InvalidReplyStatus(tag)),
                };
                Ok(Message::Reply(Reply { status, payload }))
            }
            _ => Err(MessageError::InvalidClass(class)),
        }
    }

    /// Writes the framed message and flushes, so the other end never
    /// blocks on a partially buffered frame.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), MessageError> {
        writer
            .write_all(&self.as_bytes())
            .map_err(MessageError::WriteError)?;
        writer.flush().map_err(MessageError::WriteError)
    }
}

/// Reads exactly one framed message, blocking until it is complete.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, MessageError> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            MessageError::ConnectionClosed
        } else {
            MessageError::ReadError(err)
        }
    })?;
    let length = u32::from_be_bytes(length_bytes);
    if length > MAX_FRAME_LEN {
        return Err(MessageError::FrameTooLong(length));
    }
    if length < 2 {
        return Err(MessageError::FrameTooShort);
    }
    let mut frame = vec![0u8; length as usize];
    reader
        .read_exact(&mut frame)
        .map_err(MessageError::ReadError)?;
    Message::from_frame(&frame)
}

/// Reads one message and expects it to be a request.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request, MessageError> {
    match read_message(reader)? {
        Message::Request(request) => Ok(request),
        Message::Reply(_) => Err(MessageError::UnexpectedMessage),
    }
}

/// Reads one message and expects it to be a reply.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Reply, MessageError> {
    match read_message(reader)? {
        Message::Reply(reply) => Ok(reply),
        Message::Request(_) => Err(MessageError::UnexpectedMessage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_round_trip() {
        let request = Request::new(RequestKind::Search, vec![1, 2, 3]);
        let mut buffer = Vec::new();
        Message::Request(request.clone())
            .write_to(&mut buffer)
            .unwrap();

        let decoded = read_request(&mut Cursor::new(buffer)).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = Reply::success(b"payload".to_vec());
        let mut buffer = Vec::new();
        Message::Reply(reply.clone()).write_to(&mut buffer).unwrap();

        let decoded = read_reply(&mut Cursor::new(buffer)).unwrap();

        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_check_alive_frame_layout() {
        let bytes = Message::Request(Request::empty(RequestKind::CheckAlive)).as_bytes();

        // length 2, class request, tag 6, no payload
        assert_eq!(bytes, vec![0, 0, 0, 2, 0, 6]);
    }

    #[test]
    fn test_failure_reply_has_no_payload() {
        let bytes = Message::Reply(Reply::failure()).as_bytes();

        assert_eq!(bytes, vec![0, 0, 0, 2, 1, 1]);
    }

    #[test]
    fn test_unknown_request_kind() {
        let result = Message::from_frame(&[0, 99]);

        assert!(matches!(result, Err(MessageError::UnknownRequestKind(99))));
    }

    #[test]
    fn test_invalid_class() {
        let result = Message::from_frame(&[7, 0]);

        assert!(matches!(result, Err(MessageError::InvalidClass(7))));
    }

    #[test]
    fn test_truncated_stream_is_connection_closed() {
        let mut cursor = Cursor::new(vec![]);

        let result = read_message(&mut cursor);

        assert!(matches!(result, Err(MessageError::ConnectionClosed)));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend((MAX_FRAME_LEN + 1).to_be_bytes());
        bytes.extend([0, 0]);

        let result = read_message(&mut Cursor::new(bytes));

        assert!(matches!(result, Err(MessageError::FrameTooLong(_))));
    }

    #[test]
    fn test_reply_where_request_expected() {
        let mut buffer = Vec::new();
        Message::Reply(Reply::success_empty())
            .write_to(&mut buffer)
            .unwrap();

        let result = read_request(&mut Cursor::new(buffer));

        assert!(matches!(result, Err(MessageError::UnexpectedMessage)));
    }
}
