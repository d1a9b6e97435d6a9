use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Possible errors while decoding a payload.
#[derive(PartialEq, Eq, Debug)]
pub enum PayloadError {
    UnexpectedEndOfPayload,
    InvalidUtf8String,
    TrailingBytes,
}

/// Cursor over the raw bytes of a payload.
///
/// Every multi-byte integer on the wire is big endian; strings and byte
/// blobs are prefixed with their `u32` length.
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], PayloadError> {
        if self.position + count > self.bytes.len() {
            return Err(PayloadError::UnexpectedEndOfPayload);
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, PayloadError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, PayloadError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PayloadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, PayloadError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, PayloadError> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn read_string(&mut self) -> Result<String, PayloadError> {
        let length = self.read_u32()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PayloadError::InvalidUtf8String)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, PayloadError> {
        let length = self.read_u32()? as usize;
        Ok(self.take(length)?.to_vec())
    }

    /// Consumes whatever is left of the payload.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.bytes[self.position..].to_vec();
        self.position = self.bytes.len();
        rest
    }

    /// Fails if the payload was longer than what the message needed.
    pub fn finish(&self) -> Result<(), PayloadError> {
        if self.position != self.bytes.len() {
            return Err(PayloadError::TrailingBytes);
        }
        Ok(())
    }
}

/// Builder for the raw bytes of a payload, mirror of `PayloadReader`.
#[derive(Default)]
pub struct PayloadWriter {
    bytes: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.bytes.extend(value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.bytes.extend(value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.bytes.extend(value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.bytes.extend(value.to_be_bytes());
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.bytes.extend(value.as_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.bytes.extend(value);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A username and its plaintext password as sent on REGISTER and LOGIN.
///
/// A missing password and an empty password are the same thing on the
/// wire, so the empty string is substituted when none was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn from_optional(username: String, password: Option<String>) -> Self {
        Self {
            username,
            password: password.unwrap_or_default(),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.put_string(&self.username);
        writer.put_string(&self.password);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(bytes);
        let username = reader.read_string()?;
        let password = reader.read_string()?;
        reader.finish()?;
        Ok(Self { username, password })
    }
}

/// A shared file as announced to the tracker.
///
/// Equality and hashing are by filename only; the size travels along as
/// information for the downloading side.
#[derive(Debug, Clone)]
pub struct FileDescription {
    pub filename: String,
    pub size: i64,
}

impl FileDescription {
    pub fn new(filename: &str, size: i64) -> Self {
        Self {
            filename: filename.to_string(),
            size,
        }
    }

    fn write_to(&self, writer: &mut PayloadWriter) {
        writer.put_string(&self.filename);
        writer.put_i64(self.size);
    }

    fn read_from(reader: &mut PayloadReader) -> Result<Self, PayloadError> {
        let filename = reader.read_string()?;
        let size = reader.read_i64()?;
        Ok(Self { filename, size })
    }
}

impl PartialEq for FileDescription {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename
    }
}

impl Eq for FileDescription {}

impl Hash for FileDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.filename.hash(state);
    }
}

/// One holder of a file as returned by a SEARCH, a defensive copy of the
/// live session's username and endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContact {
    pub username: String,
    pub host: String,
    pub port: u16,
}

impl PeerContact {
    pub fn new(username: &str, host: &str, port: u16) -> Self {
        Self {
            username: username.to_string(),
            host: host.to_string(),
            port,
        }
    }

    fn write_to(&self, writer: &mut PayloadWriter) {
        writer.put_string(&self.username);
        writer.put_string(&self.host);
        writer.put_u16(self.port);
    }

    fn read_from(reader: &mut PayloadReader) -> Result<Self, PayloadError> {
        let username = reader.read_string()?;
        let host = reader.read_string()?;
        let port = reader.read_u16()?;
        Ok(Self {
            username,
            host,
            port,
        })
    }
}

/// Endpoint and shared files sent by the peer in the second step of the
/// login handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAnnouncement {
    pub host: String,
    pub port: u16,
    pub files: HashSet<FileDescription>,
}

impl PeerAnnouncement {
    pub fn new(host: &str, port: u16, files: HashSet<FileDescription>) -> Self {
        Self {
            host: host.to_string(),
            port,
            files,
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.put_string(&self.host);
        writer.put_u16(self.port);
        writer.put_u32(self.files.len() as u32);
        for file in &self.files {
            file.write_to(&mut writer);
        }
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(bytes);
        let host = reader.read_string()?;
        let port = reader.read_u16()?;
        let count = reader.read_u32()?;
        let mut files = HashSet::new();
        for _ in 0..count {
            files.insert(FileDescription::read_from(&mut reader)?);
        }
        reader.finish()?;
        Ok(Self { host, port, files })
    }
}

/// Payload of a SEARCH request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub session_id: i32,
    pub filename: String,
}

impl SearchRequest {
    pub fn new(session_id: i32, filename: &str) -> Self {
        Self {
            session_id,
            filename: filename.to_string(),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.put_i32(self.session_id);
        writer.put_string(&self.filename);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(bytes);
        let session_id = reader.read_i32()?;
        let filename = reader.read_string()?;
        reader.finish()?;
        Ok(Self {
            session_id,
            filename,
        })
    }
}

/// Payload of an ACKNOWLEDGE request: who provided which file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeRequest {
    pub session_id: i32,
    pub provider_username: String,
    pub filename: String,
}

impl AcknowledgeRequest {
    pub fn new(session_id: i32, provider_username: &str, filename: &str) -> Self {
        Self {
            session_id,
            provider_username: provider_username.to_string(),
            filename: filename.to_string(),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.put_i32(self.session_id);
        writer.put_string(&self.provider_username);
        writer.put_string(&self.filename);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(bytes);
        let session_id = reader.read_i32()?;
        let provider_username = reader.read_string()?;
        let filename = reader.read_string()?;
        reader.finish()?;
        Ok(Self {
            session_id,
            provider_username,
            filename,
        })
    }
}

pub fn encode_session_id(session_id: i32) -> Vec<u8> {
    session_id.to_be_bytes().to_vec()
}

pub fn decode_session_id(bytes: &[u8]) -> Result<i32, PayloadError> {
    let mut reader = PayloadReader::new(bytes);
    let session_id = reader.read_i32()?;
    reader.finish()?;
    Ok(session_id)
}

pub fn encode_filename(filename: &str) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    writer.put_string(filename);
    writer.into_bytes()
}

pub fn decode_filename(bytes: &[u8]) -> Result<String, PayloadError> {
    let mut reader = PayloadReader::new(bytes);
    let filename = reader.read_string()?;
    reader.finish()?;
    Ok(filename)
}

/// Encodes the contact list of a successful SEARCH reply.
pub fn encode_contacts(contacts: &[PeerContact]) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    writer.put_u32(contacts.len() as u32);
    for contact in contacts {
        contact.write_to(&mut writer);
    }
    writer.into_bytes()
}

pub fn decode_contacts(bytes: &[u8]) -> Result<Vec<PeerContact>, PayloadError> {
    let mut reader = PayloadReader::new(bytes);
    let count = reader.read_u32()?;
    let mut contacts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        contacts.push(PeerContact::read_from(&mut reader)?);
    }
    reader.finish()?;
    Ok(contacts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_round_trip() {
        let credentials = Credentials::new("u1", "secret");
        let decoded = Credentials::from_bytes(&credentials.as_bytes()).unwrap();

        assert_eq!(credentials, decoded);
    }

    #[test]
    fn test_credentials_missing_password_equals_empty() {
        let missing = Credentials::from_optional("u1".to_string(), None);
        let empty = Credentials::new("u1", "");

        assert_eq!(missing, empty);
        assert_eq!(missing.as_bytes(), empty.as_bytes());
    }

    #[test]
    fn test_credentials_truncated_payload() {
        let bytes = Credentials::new("u1", "secret").as_bytes();

        let result = Credentials::from_bytes(&bytes[..bytes.len() - 1]);

        assert_eq!(result.unwrap_err(), PayloadError::UnexpectedEndOfPayload);
    }

    #[test]
    fn test_file_description_equality_ignores_size() {
        let small = FileDescription::new("a.bin", 10);
        let large = FileDescription::new("a.bin", 99999);

        assert_eq!(small, large);

        let mut files = HashSet::new();
        files.insert(small);
        assert!(!files.insert(large));
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_announcement_round_trip() {
        let mut files = HashSet::new();
        files.insert(FileDescription::new("a.bin", 3));
        files.insert(FileDescription::new("b.bin", 7));
        let announcement = PeerAnnouncement::new("127.0.0.1", 4040, files);

        let decoded = PeerAnnouncement::from_bytes(&announcement.as_bytes()).unwrap();

        assert_eq!(announcement, decoded);
    }

    #[test]
    fn test_empty_announcement_round_trip() {
        let announcement = PeerAnnouncement::new("10.0.0.7", 1, HashSet::new());

        let decoded = PeerAnnouncement::from_bytes(&announcement.as_bytes()).unwrap();

        assert_eq!(decoded.files.len(), 0);
        assert_eq!(announcement, decoded);
    }

    #[test]
    fn test_search_request_round_trip() {
        let request = SearchRequest::new(-77, "a.bin");

        let decoded = SearchRequest::from_bytes(&request.as_bytes()).unwrap();

        assert_eq!(request, decoded);
    }

    #[test]
    fn test_acknowledge_request_round_trip() {
        let request = AcknowledgeRequest::new(42, "u2", "b.bin");

        let decoded = AcknowledgeRequest::from_bytes(&request.as_bytes()).unwrap();

        assert_eq!(request, decoded);
    }

    #[test]
    fn test_contacts_round_trip() {
        let contacts = vec![
            PeerContact::new("u1", "127.0.0.1", 5000),
            PeerContact::new("u2", "10.1.2.3", 5001),
        ];

        let decoded = decode_contacts(&encode_contacts(&contacts)).unwrap();

        assert_eq!(contacts, decoded);
    }

    #[test]
    fn test_session_id_round_trip() {
        assert_eq!(decode_session_id(&encode_session_id(123456)).unwrap(), 123456);
        assert_eq!(decode_session_id(&encode_session_id(-1)).unwrap(), -1);
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode_session_id(7);
        bytes.push(0);

        assert_eq!(
            decode_session_id(&bytes).unwrap_err(),
            PayloadError::TrailingBytes
        );
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut writer = PayloadWriter::new();
        writer.put_bytes(&[0xff, 0xfe]);
        let bytes = writer.into_bytes();

        assert_eq!(
            decode_filename(&bytes).unwrap_err(),
            PayloadError::InvalidUtf8String
        );
    }
}
