//! Passphrase agent client
//!
//! Speaks the Assuan line protocol used by gpg-agent over the Unix socket
//! named in `GPG_AGENT_INFO` (`socket:pid:protocol`). Only two commands
//! are needed: GET_PASSPHRASE and CLEAR_PASSPHRASE.

use crate::error::{Result, VaultError};
use crate::passphrase::{PassphraseRequest, PassphraseResponse, PassphraseSource};
use age::secrecy::SecretString;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use zeroize::Zeroizing;

/// GPG_ERR_CANCELED, in the low 16 bits of an ERR code
const ERR_CANCELED: u32 = 99;

enum Reply {
    Ok {
        data: Zeroizing<Vec<u8>>,
        status: String,
    },
    Err {
        code: u32,
        message: String,
    },
}

pub struct AgentClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl AgentClient {
    /// Connect to the agent described by a `GPG_AGENT_INFO` value
    pub fn connect(agent_info: &str) -> Result<Self> {
        let socket = agent_info
            .split(':')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VaultError::Agent(format!("no socket in {:?}", agent_info)))?;

        let stream = UnixStream::connect(socket).map_err(|e| {
            VaultError::Agent(format!("couldn't open agent socket {}: {}", socket, e))
        })?;

        Self::from_stream(stream)
    }

    /// Wrap an established channel and consume the agent's greeting
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        let reader = stream.try_clone().map_err(agent_io)?;
        let mut client = Self {
            reader: BufReader::new(reader),
            writer: stream,
        };

        match client.read_reply()? {
            Reply::Ok { .. } => Ok(client),
            Reply::Err { message, .. } => Err(VaultError::Agent(message)),
        }
    }

    fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).map_err(agent_io)?;
        self.writer.write_all(b"\n").map_err(agent_io)?;
        self.writer.flush().map_err(agent_io)
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut data = Zeroizing::new(Vec::new());

        loop {
            let mut line = Zeroizing::new(String::new());
            let read = self.reader.read_line(&mut line).map_err(agent_io)?;
            if read == 0 {
                return Err(VaultError::Agent("agent closed the connection".to_string()));
            }
            let line = line.trim_end_matches(['\r', '\n']);

            if line == "OK" || line.starts_with("OK ") {
                return Ok(Reply::Ok {
                    data,
                    status: line.get(3..).unwrap_or_default().to_string(),
                });
            }

            if let Some(payload) = line.strip_prefix("D ") {
                data.extend_from_slice(&unescape(payload));
            } else if let Some(rest) = line.strip_prefix("ERR ") {
                let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
                return Ok(Reply::Err {
                    code: code.parse().unwrap_or(0),
                    message: message.to_string(),
                });
            } else if line.starts_with("INQUIRE") {
                // Nothing to offer the agent
                self.send("CAN")?;
            }
            // Status ("S") and comment ("#") lines are informational
        }
    }
}

impl PassphraseSource for AgentClient {
    fn get_passphrase(&mut self, request: &PassphraseRequest) -> Result<PassphraseResponse> {
        let cache_id = if request.cacheable {
            escape(&request.cache_id)
        } else {
            "X".to_string()
        };

        let command = format!(
            "GET_PASSPHRASE --data {} {} {} {}",
            cache_id,
            escape(request.error.as_deref().unwrap_or("")),
            escape(&request.prompt),
            escape(&request.description),
        );
        self.send(&command)?;

        match self.read_reply()? {
            Reply::Ok { data, status } => {
                // Older agents answer `OK <hex>` instead of D lines
                let raw = if data.is_empty() && !status.is_empty() {
                    Zeroizing::new(
                        hex::decode(status.trim())
                            .map_err(|_| VaultError::Agent("unreadable passphrase reply".into()))?,
                    )
                } else {
                    data
                };

                let passphrase = String::from_utf8(raw.to_vec())
                    .map_err(|_| VaultError::Agent("passphrase is not valid UTF-8".to_string()))?;
                Ok(PassphraseResponse::Passphrase(SecretString::new(passphrase)))
            }
            Reply::Err { code, .. } if code & 0xFFFF == ERR_CANCELED => {
                Ok(PassphraseResponse::Cancelled)
            }
            Reply::Err { code, message } => Err(VaultError::Agent(format!(
                "GET_PASSPHRASE failed ({}): {}",
                code, message
            ))),
        }
    }

    fn forget(&mut self, cache_id: &str) -> Result<()> {
        self.send(&format!("CLEAR_PASSPHRASE {}", escape(cache_id)))?;

        match self.read_reply()? {
            Reply::Ok { .. } => Ok(()),
            Reply::Err { code, message } => Err(VaultError::Agent(format!(
                "CLEAR_PASSPHRASE failed ({}): {}",
                code, message
            ))),
        }
    }
}

fn agent_io(e: std::io::Error) -> VaultError {
    VaultError::Agent(e.to_string())
}

/// Escape a command argument: `+` for space, `%XX` for anything special,
/// and `X` for an empty argument
fn escape(arg: &str) -> String {
    if arg.is_empty() {
        return "X".to_string();
    }

    let mut out = String::with_capacity(arg.len());
    for ch in arg.chars() {
        match ch {
            ' ' => out.push('+'),
            '%' | '+' => out.push_str(&format!("%{:02X}", ch as u32)),
            c if c.is_ascii_control() => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn unescape(data: &str) -> Vec<u8> {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(byte) = u8::from_str_radix(&data[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
