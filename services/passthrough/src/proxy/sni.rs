//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! Works on whatever bytes the first read produced. Nothing is decrypted and
//! nothing is consumed from the socket here; the caller replays the same
//! buffer to the backend.

use thiserror::Error;

/// TLS record type for handshake messages.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name.
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// server_name entry type for DNS host names.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Reasons a server name could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SniError {
    /// First bytes are not a TLS handshake record carrying a ClientHello.
    #[error("not a TLS ClientHello")]
    NotTls,
    /// ClientHello is truncated or internally inconsistent.
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
    /// ClientHello parsed but has no server_name host entry.
    #[error("ClientHello has no server name")]
    NoServerName,
    /// Server name is not valid UTF-8.
    #[error("server name is not valid UTF-8")]
    InvalidUtf8,
}

/// Extract the server name from a buffer starting with a TLS ClientHello.
///
/// The name is returned exactly as the client sent it.
///
/// TLS Record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - byte 38: session ID length
/// - variable: session ID
/// - 2 bytes: cipher suites length
/// - variable: cipher suites
/// - 1 byte: compression methods length
/// - variable: compression methods
/// - 2 bytes: extensions length
/// - variable: extensions
pub fn extract_sni(data: &[u8]) -> Result<String, SniError> {
    if data.is_empty() {
        return Err(SniError::Malformed("empty buffer"));
    }
    if data[0] != RECORD_TYPE_HANDSHAKE {
        return Err(SniError::NotTls);
    }
    // Record header (5) + handshake type (1) + handshake length (3)
    if data.len() < 9 {
        return Err(SniError::Malformed("truncated record header"));
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let record_end = (5 + record_len).min(data.len());
    let handshake = &data[5..record_end];

    if handshake.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        return Err(SniError::NotTls);
    }
    if handshake.len() < 4 {
        return Err(SniError::Malformed("truncated handshake header"));
    }

    let handshake_len =
        ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | (handshake[3] as usize);
    let hello_end = (4 + handshake_len).min(handshake.len());
    let client_hello = &handshake[4..hello_end];

    let mut reader = Reader::new(client_hello);

    // Client version (2) + random (32)
    reader.skip(34, "truncated random")?;

    let session_id_len = reader.u8("missing session id")? as usize;
    reader.skip(session_id_len, "truncated session id")?;

    let cipher_suites_len = reader.u16("missing cipher suites")? as usize;
    reader.skip(cipher_suites_len, "truncated cipher suites")?;

    let compression_len = reader.u8("missing compression methods")? as usize;
    reader.skip(compression_len, "truncated compression methods")?;

    if reader.is_empty() {
        // No extensions at all
        return Err(SniError::NoServerName);
    }

    let extensions_len = reader.u16("missing extensions length")? as usize;
    let mut extensions = Reader::new(reader.take_up_to(extensions_len));

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16("truncated extension type")?;
        let ext_len = extensions.u16("truncated extension length")? as usize;
        let body = extensions.take(ext_len, "truncated extension body")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(body);
        }
    }

    Err(SniError::NoServerName)
}

/// Parse the server_name extension value.
///
/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name_extension(data: &[u8]) -> Result<String, SniError> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16("missing server name list length")? as usize;
    let mut list = Reader::new(reader.take(list_len, "truncated server name list")?);

    while list.remaining() >= 3 {
        let name_type = list.u8("truncated name type")?;
        let name_len = list.u16("truncated name length")? as usize;
        let name = list.take(name_len, "truncated server name")?;

        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(str::to_string)
                .map_err(|_| SniError::InvalidUtf8);
        }
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], SniError> {
        if self.remaining() < len {
            return Err(SniError::Malformed(context));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Like `take`, but clamps to what is left instead of failing.
    fn take_up_to(&mut self, len: usize) -> &'a [u8] {
        let len = len.min(self.remaining());
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        slice
    }

    fn skip(&mut self, len: usize, context: &'static str) -> Result<(), SniError> {
        self.take(len, context).map(|_| ())
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, context)?[0])
    }

    fn u16(&mut self, context: &'static str) -> Result<u16, SniError> {
        let bytes = self.take(2, context)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
