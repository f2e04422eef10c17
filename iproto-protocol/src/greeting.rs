//! Server greeting banner.
//!
//! The server sends exactly [`GREETING_SIZE`] bytes right after accept:
//!
//! ```text
//! Tarantool 2.11.1 (Binary) 7e2f1b3c-...-uuid              \n   <- 64 bytes
//! <base64 salt>                                             \n   <- 64 bytes
//! ```

use crate::error::ProtocolError;
use base64::Engine;
use uuid::Uuid;

/// Total size of the greeting.
pub const GREETING_SIZE: usize = 128;

/// Size of each greeting line, including the trailing newline.
pub const GREETING_LINE_SIZE: usize = 64;

/// Number of salt bytes used by the chap-sha1 scramble.
pub const SCRAMBLE_SALT_SIZE: usize = 20;

const BINARY_PROTOCOL: &str = "Binary";

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Server product name, e.g. `Tarantool`.
    pub product: String,
    /// Server version string, e.g. `2.11.1`.
    pub version: String,
    /// Protocol label found in parentheses, `Binary` for IProto.
    pub protocol: String,
    /// Server instance UUID (absent on very old servers).
    pub instance_uuid: Option<Uuid>,
    /// Decoded salt.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Parses a 128-byte greeting.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() != GREETING_SIZE {
            return Err(bad(format!(
                "expected {} bytes, got {}",
                GREETING_SIZE,
                raw.len()
            )));
        }

        let (line1, line2) = raw.split_at(GREETING_LINE_SIZE);
        let line1 = banner_line(line1, "version line")?;
        let line2 = banner_line(line2, "salt line")?;

        let mut parts = line1.split_whitespace();
        let product = parts
            .next()
            .ok_or_else(|| bad("empty version line".to_string()))?;
        let version = parts
            .next()
            .ok_or_else(|| bad("missing server version".to_string()))?;
        let protocol = parts
            .next()
            .and_then(|p| p.strip_prefix('('))
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(|| bad("missing protocol label".to_string()))?;
        if protocol != BINARY_PROTOCOL {
            return Err(bad(format!("unsupported protocol '{}'", protocol)));
        }
        let instance_uuid = match parts.next() {
            Some(s) => Some(
                Uuid::parse_str(s).map_err(|e| bad(format!("invalid instance uuid: {}", e)))?,
            ),
            None => None,
        };

        let salt = base64::engine::general_purpose::STANDARD
            .decode(line2.trim())
            .map_err(|e| bad(format!("invalid salt: {}", e)))?;
        if salt.len() < SCRAMBLE_SALT_SIZE {
            return Err(bad(format!("salt too short: {} bytes", salt.len())));
        }

        Ok(Self {
            product: product.to_string(),
            version: version.to_string(),
            protocol: protocol.to_string(),
            instance_uuid,
            salt,
        })
    }

    /// Renders the greeting in wire form. Used by test servers and tools.
    pub fn encode(&self) -> Result<[u8; GREETING_SIZE], ProtocolError> {
        let mut line1 = format!("{} {} ({})", self.product, self.version, self.protocol);
        if let Some(uuid) = self.instance_uuid {
            line1.push(' ');
            line1.push_str(&uuid.to_string());
        }
        let line2 = base64::engine::general_purpose::STANDARD.encode(&self.salt);

        let mut out = [b' '; GREETING_SIZE];
        for (offset, line) in [(0, line1), (GREETING_LINE_SIZE, line2)] {
            if line.len() >= GREETING_LINE_SIZE {
                return Err(bad(format!("line too long: {} bytes", line.len())));
            }
            out[offset..offset + line.len()].copy_from_slice(line.as_bytes());
            out[offset + GREETING_LINE_SIZE - 1] = b'\n';
        }
        Ok(out)
    }

    /// Salt prefix used by the chap-sha1 scramble.
    pub fn scramble_salt(&self) -> &[u8] {
        &self.salt[..SCRAMBLE_SALT_SIZE]
    }
}

fn banner_line<'a>(line: &'a [u8], what: &str) -> Result<&'a str, ProtocolError> {
    if line.last() != Some(&b'\n') {
        return Err(bad(format!("{} is not newline-terminated", what)));
    }
    std::str::from_utf8(&line[..line.len() - 1])
        .map_err(|_| bad(format!("{} is not valid UTF-8", what)))
}

fn bad(reason: String) -> ProtocolError {
    ProtocolError::BadGreeting(reason)
}
