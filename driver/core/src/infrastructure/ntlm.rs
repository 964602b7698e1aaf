// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NTLMv2 client messages for WinRM authentication
//!
//! Hyper-V hosts accept NTLM out of the box, Basic only after reconfiguration.
//! This is the three-message handshake (NEGOTIATE, CHALLENGE, AUTHENTICATE)
//! with NTLMv2 responses. No session key is exchanged, so the host must allow
//! unencrypted payloads when the endpoint is plain HTTP.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use thiserror::Error;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const TYPE_NEGOTIATE: u32 = 1;
const TYPE_CHALLENGE: u32 = 2;
const TYPE_AUTHENTICATE: u32 = 3;

const FLAG_UNICODE: u32 = 0x0000_0001;
const FLAG_REQUEST_TARGET: u32 = 0x0000_0004;
const FLAG_NTLM: u32 = 0x0000_0200;
const FLAG_ALWAYS_SIGN: u32 = 0x0000_8000;
const FLAG_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const FLAG_TARGET_INFO: u32 = 0x0080_0000;
const FLAG_128: u32 = 0x2000_0000;
const FLAG_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = FLAG_UNICODE
    | FLAG_REQUEST_TARGET
    | FLAG_NTLM
    | FLAG_ALWAYS_SIGN
    | FLAG_EXTENDED_SESSION_SECURITY
    | FLAG_TARGET_INFO
    | FLAG_128
    | FLAG_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

const NEGOTIATE_LEN: usize = 32;
const AUTHENTICATE_HEADER_LEN: usize = 64;

/// Seconds between 1601-01-01 and the Unix epoch
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NtlmError {
    #[error("malformed NTLM challenge: {0}")]
    MalformedChallenge(&'static str),

    #[error("invalid HMAC key: {0}")]
    Key(String),
}

/// Account the handshake proves, split from `DOMAIN\user` when given that way
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub domain: String,
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        let (domain, user) = match username.split_once('\\') {
            Some((domain, user)) => (domain.to_string(), user.to_string()),
            None => (String::new(), username.to_string()),
        };
        Self {
            domain,
            user,
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// CHALLENGE message fields the client response depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Challenge {
    pub fn parse(message: &[u8]) -> Result<Self, NtlmError> {
        if message.len() < 48 || &message[..8] != SIGNATURE {
            return Err(NtlmError::MalformedChallenge("missing NTLMSSP signature"));
        }
        if read_u32(message, 8) != Some(TYPE_CHALLENGE) {
            return Err(NtlmError::MalformedChallenge("not a CHALLENGE message"));
        }
        let flags = read_u32(message, 20).ok_or(NtlmError::MalformedChallenge("truncated"))?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&message[24..32]);
        let target_info = security_buffer(message, 40)
            .ok_or(NtlmError::MalformedChallenge("target info out of bounds"))?
            .to_vec();

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// MsvAvTimestamp from the target info, as a FILETIME
    fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut at = 0;
        while at + 4 <= info.len() {
            let id = u16::from_le_bytes([info[at], info[at + 1]]);
            let len = u16::from_le_bytes([info[at + 2], info[at + 3]]) as usize;
            let value = info.get(at + 4..at + 4 + len)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP if len == 8 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(value);
                    return Some(u64::from_le_bytes(bytes));
                }
                _ => at += 4 + len,
            }
        }
        None
    }
}

/// First message: announce what the client supports
pub fn negotiate_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(NEGOTIATE_LEN);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&TYPE_NEGOTIATE.to_le_bytes());
    message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    // Domain and workstation are not supplied
    push_security_buffer(&mut message, 0, NEGOTIATE_LEN);
    push_security_buffer(&mut message, 0, NEGOTIATE_LEN);
    message
}

/// Third message: NTLMv2 responses to the host's challenge
pub fn authenticate_message(credentials: &Credentials, challenge: &Challenge) -> Result<Vec<u8>, NtlmError> {
    let client_challenge: [u8; 8] = rand::random();
    let timestamp = challenge.timestamp().unwrap_or_else(now_filetime);
    authenticate_message_with(credentials, challenge, client_challenge, timestamp)
}

fn authenticate_message_with(
    credentials: &Credentials,
    challenge: &Challenge,
    client_challenge: [u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>, NtlmError> {
    let key = ntowf_v2(credentials)?;
    let lm_response = lmv2_response(&key, &challenge.server_challenge, &client_challenge)?;
    let nt_response = ntlmv2_response(
        &key,
        &challenge.server_challenge,
        &client_challenge,
        timestamp,
        &challenge.target_info,
    )?;

    let domain = utf16le(&credentials.domain);
    let user = utf16le(&credentials.user);
    let workstation: Vec<u8> = Vec::new();
    let session_key: Vec<u8> = Vec::new();
    let payloads = [&lm_response, &nt_response, &domain, &user, &workstation, &session_key];

    let mut message = Vec::with_capacity(
        AUTHENTICATE_HEADER_LEN + payloads.iter().map(|p| p.len()).sum::<usize>(),
    );
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&TYPE_AUTHENTICATE.to_le_bytes());
    let mut offset = AUTHENTICATE_HEADER_LEN;
    for payload in payloads {
        push_security_buffer(&mut message, payload.len(), offset);
        offset += payload.len();
    }
    let flags = (challenge.flags & CLIENT_FLAGS) | FLAG_UNICODE | FLAG_NTLM;
    message.extend_from_slice(&flags.to_le_bytes());
    for payload in payloads {
        message.extend_from_slice(payload);
    }
    Ok(message)
}

/// NTOWFv2: HMAC-MD5 keyed by the MD4 password hash over `UPPER(user) + domain`
fn ntowf_v2(credentials: &Credentials) -> Result<[u8; 16], NtlmError> {
    let nt_hash = Md4::digest(utf16le(&credentials.password));
    let identity = utf16le(&format!("{}{}", credentials.user.to_uppercase(), credentials.domain));
    hmac_md5(&nt_hash, &[identity.as_slice()])
}

fn lmv2_response(key: &[u8; 16], server: &[u8; 8], client: &[u8; 8]) -> Result<Vec<u8>, NtlmError> {
    let mut response = hmac_md5(key, &[server.as_slice(), client.as_slice()])?.to_vec();
    response.extend_from_slice(client);
    Ok(response)
}

fn ntlmv2_response(
    key: &[u8; 16],
    server: &[u8; 8],
    client: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Result<Vec<u8>, NtlmError> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let mut response = hmac_md5(key, &[server.as_slice(), blob.as_slice()])?.to_vec();
    response.extend_from_slice(&blob);
    Ok(response)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], NtlmError> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|e| NtlmError::Key(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn now_filetime() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + u64::from(since_epoch.subsec_nanos() / 100)
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn read_u32(message: &[u8], at: usize) -> Option<u32> {
    let bytes = message.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn push_security_buffer(message: &mut Vec<u8>, len: usize, offset: usize) {
    message.extend_from_slice(&(len as u16).to_le_bytes());
    message.extend_from_slice(&(len as u16).to_le_bytes());
    message.extend_from_slice(&(offset as u32).to_le_bytes());
}

/// Payload referenced by the length/offset field at `at`
pub(crate) fn security_buffer(message: &[u8], at: usize) -> Option<&[u8]> {
    let header = message.get(at..at + 8)?;
    let len = u16::from_le_bytes([header[0], header[1]]) as usize;
    let offset = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    message.get(offset..offset.checked_add(len)?)
}
