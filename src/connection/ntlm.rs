//! NTLMv2 messages for WinRM's `Negotiate` authentication
//!
//! Only the three handshake messages are produced here. The HTTP exchange
//! that carries them lives in the WinRM transport:
//!
//! 1. the client sends a Type 1 (negotiate) message
//! 2. the server answers `401` with a Type 2 (challenge) message
//! 3. the client repeats the request with a Type 3 (authenticate) message
//!
//! Session signing and sealing are not negotiated, so payloads travel as
//! plain SOAP.

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use std::fmt;

use super::{ConnectionError, ConnectionResult};

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY;

/// `MsvAvTimestamp` in the challenge's target info
const AV_TIMESTAMP: u16 = 7;
const AV_EOL: u16 = 0;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Fixed part of a Type 3 message: signature, type, six security buffers, flags
const AUTHENTICATE_HEADER_LEN: usize = 64;

/// A parsed Type 2 (challenge) message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub server_challenge: [u8; 8],
    pub flags: u32,
    /// Raw AV pairs, echoed inside the NTLMv2 response
    pub target_info: Vec<u8>,
}

impl Challenge {
    pub fn parse(message: &[u8]) -> ConnectionResult<Self> {
        if message.len() < 32 || &message[..8] != SIGNATURE {
            return Err(invalid_challenge("not an NTLMSSP message"));
        }
        if read_u32(message, 8) != Some(2) {
            return Err(invalid_challenge("not a challenge message"));
        }

        let flags = read_u32(message, 20).unwrap_or_default();
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&message[24..32]);

        let target_info = if message.len() >= 48 {
            let len = read_u16(message, 40).unwrap_or_default() as usize;
            let offset = read_u32(message, 44).unwrap_or_default() as usize;
            message
                .get(offset..offset.saturating_add(len))
                .ok_or_else(|| invalid_challenge("target info lies outside the message"))?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            server_challenge,
            flags,
            target_info,
        })
    }

    /// The server's `MsvAvTimestamp`, when it sent one
    fn timestamp(&self) -> Option<u64> {
        let mut rest = self.target_info.as_slice();
        while rest.len() >= 4 {
            let id = read_u16(rest, 0)?;
            let len = read_u16(rest, 2)? as usize;
            let value = rest.get(4..4 + len)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP if len == 8 => return read_u64(value, 0),
                _ => rest = &rest[4 + len..],
            }
        }
        None
    }
}

/// Produces NTLMv2 handshake messages for one set of credentials
#[derive(Clone)]
pub struct NtlmAuthenticator {
    username: String,
    password: String,
    domain: String,
    workstation: String,
}

impl NtlmAuthenticator {
    /// Accepts `DOMAIN\user`, `user@domain` or a bare user name.
    pub fn new(username: &str, password: impl Into<String>) -> Self {
        let (domain, user) = if let Some((domain, user)) = username.split_once('\\') {
            (domain, user)
        } else if let Some((user, domain)) = username.split_once('@') {
            (domain, user)
        } else {
            ("", username)
        };

        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().to_uppercase())
            .unwrap_or_else(|_| "WORKSTATION".to_string());

        Self {
            username: user.to_string(),
            password: password.into(),
            domain: domain.to_string(),
            workstation,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Type 1 message. Domain and workstation are left for the Type 3 message.
    pub fn negotiate_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(32);
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&1u32.to_le_bytes());
        message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        // empty domain and workstation buffers
        for _ in 0..2 {
            message.extend_from_slice(&0u16.to_le_bytes());
            message.extend_from_slice(&0u16.to_le_bytes());
            message.extend_from_slice(&32u32.to_le_bytes());
        }
        message
    }

    /// Type 3 message answering `challenge` (the raw Type 2 bytes)
    pub fn authenticate_message(&self, challenge: &[u8]) -> ConnectionResult<Vec<u8>> {
        let challenge = Challenge::parse(challenge)?;
        let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);
        let client_challenge: [u8; 8] = rand::random();
        self.authenticate_with(&challenge, client_challenge, timestamp)
    }

    fn authenticate_with(
        &self,
        challenge: &Challenge,
        client_challenge: [u8; 8],
        timestamp: u64,
    ) -> ConnectionResult<Vec<u8>> {
        let key = self.response_key()?;
        let blob = client_blob(client_challenge, timestamp, &challenge.target_info);

        let mut nt_response = nt_proof(&key, &challenge.server_challenge, &blob)?.to_vec();
        nt_response.extend_from_slice(&blob);
        let lm_response = lmv2_response(&key, &challenge.server_challenge, &client_challenge)?;

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        let mut message = Vec::with_capacity(AUTHENTICATE_HEADER_LEN + nt_response.len() + 128);
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&3u32.to_le_bytes());

        // the session key buffer stays empty
        let session_key: &[u8] = &[];
        let mut payload = Vec::new();
        for field in [
            lm_response.as_slice(),
            nt_response.as_slice(),
            domain.as_slice(),
            user.as_slice(),
            workstation.as_slice(),
            session_key,
        ] {
            let offset = AUTHENTICATE_HEADER_LEN + payload.len();
            let len = u16::try_from(field.len())
                .map_err(|_| auth_error("NTLM field does not fit in a security buffer"))?;
            let offset = u32::try_from(offset)
                .map_err(|_| auth_error("NTLM message is too large"))?;
            message.extend_from_slice(&len.to_le_bytes());
            message.extend_from_slice(&len.to_le_bytes());
            message.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(field);
        }

        message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        message.extend_from_slice(&payload);
        Ok(message)
    }

    /// NTOWFv2: HMAC-MD5 keyed with the NT hash over `UPPER(user) + domain`
    fn response_key(&self) -> ConnectionResult<[u8; 16]> {
        let identity = utf16le(&format!("{}{}", self.username.to_uppercase(), self.domain));
        hmac_md5(&nt_hash(&self.password), &[identity.as_slice()])
    }
}

impl fmt::Debug for NtlmAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmAuthenticator")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .finish()
    }
}

/// MD4 of the UTF-16LE password
fn nt_hash(password: &str) -> [u8; 16] {
    let digest = Md4::digest(utf16le(password));
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest);
    hash
}

fn client_blob(client_challenge: [u8; 8], timestamp: u64, target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);
    blob
}

fn nt_proof(key: &[u8; 16], server_challenge: &[u8; 8], blob: &[u8]) -> ConnectionResult<[u8; 16]> {
    hmac_md5(key, &[server_challenge.as_slice(), blob])
}

fn lmv2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> ConnectionResult<Vec<u8>> {
    let mut response =
        hmac_md5(key, &[server_challenge.as_slice(), client_challenge.as_slice()])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> ConnectionResult<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|e| auth_error(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Current time as a Windows FILETIME (100ns ticks since 1601)
fn filetime_now() -> u64 {
    let now = chrono::Utc::now();
    let secs = u64::try_from(now.timestamp() + FILETIME_EPOCH_OFFSET).unwrap_or_default();
    secs * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

fn invalid_challenge(detail: &str) -> ConnectionError {
    auth_error(format!("Invalid NTLM challenge: {}", detail))
}

fn auth_error(message: impl Into<String>) -> ConnectionError {
    ConnectionError::AuthenticationFailed(message.into())
}
